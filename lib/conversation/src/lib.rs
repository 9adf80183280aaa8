//! Conversation orchestration for chorus.
//!
//! This crate provides:
//!
//! - **Conversation Manager**: Routes chat-platform messages to conversations
//!   and allows one turn at a time per conversation
//! - **Conversation**: History, presets and the turn algorithm (tool calls,
//!   summarization, retry)
//! - **Scoping**: Per-group and per-member modes that decide which messages
//!   share a conversation
//! - **Tool Registry**: Tool plugins the model may call during a turn

pub mod config;
pub mod conversation;
pub mod error;
pub mod key;
pub mod manager;
pub mod preset;
pub mod sanitize;
pub mod scoping;
pub mod tool;

pub use config::OrchestratorConfig;
pub use conversation::{Attachment, AttachmentKind, Conversation, TurnInput};
pub use error::{ConversationError, FailureStage, StoreError, ToolError};
pub use key::{
    ConversationKey, ConversationKeyResolver, GroupMode, GroupScoping, LockScope, ScopingDefaults,
    ScopingTable, UserMode,
};
pub use manager::{ConversationManager, PluginsFactory, ProviderFactory, SendRequest};
pub use preset::{Preset, PresetCatalog, PresetMode, PresetSelection};
pub use scoping::{InMemoryScopingStore, JsonFileScopingStore, ScopingRegistry, ScopingStore};
pub use tool::{DedupedCalls, ToolPlugin, ToolRegistry, dedupe_tool_calls, execute_tool_calls};
