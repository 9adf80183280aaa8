//! Language-model provider abstraction.
//!
//! A provider turns a list of messages (plus optional tool declarations)
//! into a stream of reply chunks. Wire formats are the provider's business;
//! the conversation core only sees the types in this module.

use crate::error::ProviderError;
use crate::message::{Message, ToolCall};
use crate::usage::{TokenUsage, UsageCounter};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A model capability the caller may need to check before sending content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Function/tool calling.
    Tools,
    /// Image input.
    Vision,
    /// Audio input.
    Audio,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tools => write!(f, "tool calling"),
            Self::Vision => write!(f, "image input"),
            Self::Audio => write!(f, "audio input"),
        }
    }
}

/// Description of one model offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier.
    pub name: String,
    /// Context window (prompt + completion) in tokens.
    pub max_total_tokens: u64,
    /// Whether the model accepts tool declarations.
    pub supports_tools: bool,
    /// Whether the model accepts image parts.
    pub supports_vision: bool,
    /// Whether the model accepts audio parts.
    pub supports_audio: bool,
}

impl ModelSpec {
    /// Creates a text-only model description.
    #[must_use]
    pub fn new(name: impl Into<String>, max_total_tokens: u64) -> Self {
        Self {
            name: name.into(),
            max_total_tokens,
            supports_tools: false,
            supports_vision: false,
            supports_audio: false,
        }
    }

    /// Marks the model as supporting tool calls.
    #[must_use]
    pub fn with_tools(mut self) -> Self {
        self.supports_tools = true;
        self
    }

    /// Marks the model as accepting images.
    #[must_use]
    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }

    /// Marks the model as accepting audio.
    #[must_use]
    pub fn with_audio(mut self) -> Self {
        self.supports_audio = true;
        self
    }

    /// Returns whether the model has the given capability.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Tools => self.supports_tools,
            Capability::Vision => self.supports_vision,
            Capability::Audio => self.supports_audio,
        }
    }
}

/// Declaration of a tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: JsonValue,
}

impl ToolDefinition {
    /// Creates a tool definition with an empty object schema.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    /// Sets the parameter schema.
    #[must_use]
    pub fn with_parameters(mut self, schema: JsonValue) -> Self {
        self.parameters = schema;
        self
    }
}

/// A request to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    /// The full outgoing message list.
    pub messages: Vec<Message>,
    /// Tools the model may call. Empty means tool use is off.
    pub tools: Vec<ToolDefinition>,
}

impl AskRequest {
    /// Creates a request without tools.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
        }
    }

    /// Attaches tool declarations.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// One unit of a streamed reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyChunk {
    /// Text delta.
    pub content: Option<String>,
    /// Fully assembled tool calls.
    pub tool_calls: Vec<ToolCall>,
    /// Usage for the whole request, usually on the final chunk.
    pub usage: Option<TokenUsage>,
}

impl ReplyChunk {
    /// Creates a text chunk.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Creates a chunk carrying tool calls.
    #[must_use]
    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    /// Attaches usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Stream of reply chunks.
pub type ReplyStream = BoxStream<'static, Result<ReplyChunk, ProviderError>>;

/// Trait for language-model providers.
///
/// Implementations own their usage counter; the default methods expose it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g. the configured backend id).
    fn name(&self) -> &str;

    /// Returns the active model.
    fn model(&self) -> ModelSpec;

    /// Returns every model this provider can switch to.
    fn models(&self) -> Vec<ModelSpec>;

    /// Switches the active model.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownModel`] if the model is not offered.
    fn switch_model(&self, name: &str) -> Result<ModelSpec, ProviderError>;

    /// Sends a request and returns the reply stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started.
    async fn ask(&self, request: AskRequest) -> Result<ReplyStream, ProviderError>;

    /// Returns the usage counter owned by this provider.
    fn usage_counter(&self) -> &UsageCounter;

    /// Returns cumulative usage.
    fn usage(&self) -> TokenUsage {
        self.usage_counter().snapshot()
    }

    /// Returns the prompt size of the latest request.
    fn context_tokens(&self) -> u64 {
        self.usage_counter().context_tokens()
    }

    /// Clears cumulative usage.
    fn reset_usage(&self) {
        self.usage_counter().reset();
    }

    /// Sets the tracked context size.
    fn set_total_tokens(&self, tokens: u64) {
        self.usage_counter().set_total_tokens(tokens);
    }
}
