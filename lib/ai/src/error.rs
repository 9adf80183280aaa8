//! Error types for the AI crate.
//!
//! - `ProviderError`: failures reported by a model backend
//! - `MessageError`: a message that violates the dialogue invariants

use std::fmt;

/// Errors from provider operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider is unavailable.
    Unavailable { provider: String, reason: String },
    /// Request failed before any reply was produced.
    RequestFailed { reason: String },
    /// The reply stream broke off part way through.
    StreamFailed { reason: String },
    /// Timeout waiting for response.
    Timeout,
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// The requested model is not offered by this provider.
    UnknownModel { model: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { provider, reason } => {
                write!(f, "provider '{provider}' unavailable: {reason}")
            }
            Self::RequestFailed { reason } => write!(f, "provider request failed: {reason}"),
            Self::StreamFailed { reason } => write!(f, "reply stream failed: {reason}"),
            Self::Timeout => write!(f, "provider request timed out"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::UnknownModel { model } => write!(f, "unknown model: {model}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// A message that cannot exist in a dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The wire form has no `role`.
    MissingRole,
    /// The role string is not one of the four known roles.
    UnknownRole { role: String },
    /// An assistant message with neither content nor tool calls.
    EmptyAssistant,
    /// A tool result without the id of the call it answers.
    MissingToolCallId,
    /// A non-assistant message without content.
    MissingContent { role: String },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRole => write!(f, "message has no role"),
            Self::UnknownRole { role } => write!(f, "unknown message role: {role}"),
            Self::EmptyAssistant => {
                write!(f, "assistant message needs content or tool calls")
            }
            Self::MissingToolCallId => write!(f, "tool message has no tool_call_id"),
            Self::MissingContent { role } => write!(f, "{role} message has no content"),
        }
    }
}

impl std::error::Error for MessageError {}
