//! Language-model provider contract for chorus.
//!
//! This crate describes what the conversation core needs from a model
//! backend without committing to any vendor's wire format:
//!
//! - **Messages**: the tagged dialogue vocabulary (`system`, `user`,
//!   `assistant`, `tool`), validated at construction
//! - **Provider**: streamed replies, capability flags, model switching
//! - **Usage**: cumulative token accounting owned by each provider

pub mod error;
pub mod message;
pub mod provider;
pub mod usage;

pub use error::{MessageError, ProviderError};
pub use message::{Content, ContentPart, FunctionCall, Message, MessageRole, ToolCall};
pub use provider::{
    AskRequest, Capability, ModelSpec, Provider, ReplyChunk, ReplyStream, ToolDefinition,
};
pub use usage::{TokenUsage, UsageCounter};
