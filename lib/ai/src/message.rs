//! Message types for dialogues.
//!
//! A [`Message`] is one of four shapes. Invalid combinations (an assistant
//! message with nothing in it, a tool result that answers no call) are
//! rejected when the message is built or deserialized, so code that reads a
//! history never has to second-guess it.

use crate::error::MessageError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction.
    System,
    /// User/human message.
    User,
    /// Assistant/AI message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl MessageRole {
    /// Returns the wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// An image, by URL or data reference.
    Image {
        #[serde(rename = "ref")]
        reference: String,
    },
    /// An audio clip, by URL or data reference.
    Audio {
        #[serde(rename = "ref")]
        reference: String,
    },
}

impl ContentPart {
    /// Creates a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates an image part.
    #[must_use]
    pub fn image(reference: impl Into<String>) -> Self {
        Self::Image {
            reference: reference.into(),
        }
    }

    /// Creates an audio part.
    #[must_use]
    pub fn audio(reference: impl Into<String>) -> Self {
        Self::Audio {
            reference: reference.into(),
        }
    }

    /// Returns false for parts with nothing usable in them.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Text { text } => !text.is_empty(),
            Self::Image { reference } | Self::Audio { reference } => !reference.trim().is_empty(),
        }
    }
}

/// Message content: either a plain string or a list of parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content.
    Text(String),
    /// Multimodal content.
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenates every text fragment.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Returns true if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }

    /// Returns true if any part is an image.
    #[must_use]
    pub fn has_image(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }

    /// Returns true if any part is audio.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Audio { .. })))
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// The function half of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionCall {
    /// The tool name.
    pub name: String,
    /// Arguments as a JSON document, kept verbatim.
    pub arguments: String,
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// The function to invoke.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Creates a new tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Parses the arguments. An empty string is treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the arguments are not valid JSON.
    pub fn parse_arguments(&self) -> Result<JsonValue, serde_json::Error> {
        if self.function.arguments.trim().is_empty() {
            return Ok(JsonValue::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.function.arguments)
    }
}

/// A message in a dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    /// System instruction.
    System { content: String },
    /// User input.
    User { content: Content },
    /// Assistant reply, possibly requesting tool calls.
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// Result of one tool call.
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl Message {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<Content>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Creates a plain assistant reply.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Creates an assistant message carrying tool calls.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::EmptyAssistant`] if there is neither content
    /// nor a tool call.
    pub fn assistant_with_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Result<Self, MessageError> {
        let content = content.filter(|c| !c.is_empty());
        if content.is_none() && tool_calls.is_empty() {
            return Err(MessageError::EmptyAssistant);
        }
        Ok(Self::Assistant {
            content,
            tool_calls,
        })
    }

    /// Creates a tool result message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Returns the role of this message.
    #[must_use]
    pub fn role(&self) -> MessageRole {
        match self {
            Self::System { .. } => MessageRole::System,
            Self::User { .. } => MessageRole::User,
            Self::Assistant { .. } => MessageRole::Assistant,
            Self::Tool { .. } => MessageRole::Tool,
        }
    }

    /// Returns the textual content, empty if there is none.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::System { content } | Self::Tool { content, .. } => content.clone(),
            Self::User { content } => content.text(),
            Self::Assistant { content, .. } => content.clone().unwrap_or_default(),
        }
    }

    /// Returns the tool calls carried by an assistant message.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Returns true if this message has tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }

    /// Returns true for tool-call requests and tool results.
    #[must_use]
    pub fn involves_tools(&self) -> bool {
        self.has_tool_calls() || matches!(self, Self::Tool { .. })
    }

    /// Returns true if this is a system message.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    /// Returns true if the message carries image parts.
    #[must_use]
    pub fn has_image(&self) -> bool {
        matches!(self, Self::User { content } if content.has_image())
    }

    /// Returns true if the message carries audio parts.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        matches!(self, Self::User { content } if content.has_audio())
    }
}

/// Flat wire form, matching the common chat-completion layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl TryFrom<WireMessage> for Message {
    type Error = MessageError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let role = wire.role.ok_or(MessageError::MissingRole)?;
        match role.as_str() {
            "system" => {
                let content = wire.content.ok_or_else(|| MessageError::MissingContent {
                    role: role.clone(),
                })?;
                Ok(Self::System {
                    content: content.text(),
                })
            }
            "user" => {
                let content = wire.content.ok_or_else(|| MessageError::MissingContent {
                    role: role.clone(),
                })?;
                Ok(Self::User { content })
            }
            "assistant" => {
                Self::assistant_with_tool_calls(wire.content.map(|c| c.text()), wire.tool_calls)
            }
            "tool" => {
                let tool_call_id = wire.tool_call_id.ok_or(MessageError::MissingToolCallId)?;
                Ok(Self::Tool {
                    tool_call_id,
                    content: wire.content.map(|c| c.text()).unwrap_or_default(),
                })
            }
            _ => Err(MessageError::UnknownRole { role }),
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let role = Some(message.role().as_str().to_string());
        match message {
            Message::System { content } => Self {
                role,
                content: Some(Content::Text(content)),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            Message::User { content } => Self {
                role,
                content: Some(content),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            Message::Assistant {
                content,
                tool_calls,
            } => Self {
                role,
                content: content.map(Content::Text),
                tool_calls,
                tool_call_id: None,
            },
            Message::Tool {
                tool_call_id,
                content,
            } => Self {
                role,
                content: Some(Content::Text(content)),
                tool_calls: Vec::new(),
                tool_call_id: Some(tool_call_id),
            },
        }
    }
}
