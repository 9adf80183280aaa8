//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ConversationError`: outcome of a manager operation, reported to callers
//! - `ToolError`: a tool plugin failure, always folded into a tool result
//! - `StoreError`: durable scoping store failures

use chorus_ai::Capability;
use std::fmt;

/// Which provider call a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The main request of a turn.
    Request,
    /// The request made after tool results were gathered.
    FollowUp,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::FollowUp => write!(f, "follow-up"),
        }
    }
}

/// Errors from conversation operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    /// Another turn holds the conversation (or group) lock.
    Busy { key: String },
    /// The history outgrew the budget and could not be summarized.
    CapacityExceeded { reason: String },
    /// The provider failed.
    Provider { stage: FailureStage, reason: String },
    /// The turn was interrupted before it could commit.
    Interrupted { key: String },
    /// There is no answered user message to retry.
    NothingToRetry,
    /// The requested model does not exist.
    UnknownModel { model: String },
    /// The model lacks a capability the existing history relies on.
    IncompatibleModel {
        model: String,
        capability: Capability,
    },
    /// The requested provider does not exist.
    UnknownProvider { name: String },
    /// The requested preset does not exist.
    UnknownPreset { name: String },
    /// No conversation exists for the key.
    NotFound { key: String },
    /// The user input cannot be sent.
    InvalidInput { reason: String },
}

impl ConversationError {
    /// Returns the text shown to the chat participant for this error.
    #[must_use]
    pub fn reply_text(&self) -> String {
        match self {
            Self::Busy { .. } => {
                "I'm still working on the previous message, please wait a moment.".to_string()
            }
            Self::CapacityExceeded { .. } => {
                "This conversation has grown too long and I couldn't condense it. Start a new conversation to continue.".to_string()
            }
            Self::Provider { reason, .. } => {
                format!("Sorry, something went wrong while generating a reply: {reason}")
            }
            Self::Interrupted { .. } => "The previous reply was cancelled.".to_string(),
            Self::NothingToRetry => "There is nothing to retry yet.".to_string(),
            Self::UnknownModel { model } => format!("There is no model called '{model}'."),
            Self::IncompatibleModel { model, capability } => format!(
                "Model '{model}' does not support {capability}, which this conversation already uses. Start a new conversation to switch."
            ),
            Self::UnknownProvider { name } => format!("There is no provider called '{name}'."),
            Self::UnknownPreset { name } => format!("There is no preset called '{name}'."),
            Self::NotFound { .. } => "There is no conversation here yet.".to_string(),
            Self::InvalidInput { reason } => format!("I can't send that: {reason}."),
        }
    }
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { key } => write!(f, "conversation {key} is busy"),
            Self::CapacityExceeded { reason } => {
                write!(f, "conversation capacity exceeded: {reason}")
            }
            Self::Provider { stage, reason } => {
                write!(f, "provider {stage} failed: {reason}")
            }
            Self::Interrupted { key } => write!(f, "turn for {key} was interrupted"),
            Self::NothingToRetry => write!(f, "nothing to retry"),
            Self::UnknownModel { model } => write!(f, "unknown model: {model}"),
            Self::IncompatibleModel { model, capability } => {
                write!(f, "model {model} lacks {capability} required by history")
            }
            Self::UnknownProvider { name } => write!(f, "unknown provider: {name}"),
            Self::UnknownPreset { name } => write!(f, "unknown preset: {name}"),
            Self::NotFound { key } => write!(f, "conversation not found: {key}"),
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
        }
    }
}

impl std::error::Error for ConversationError {}

/// Errors from tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Tool not found.
    NotFound { name: String },
    /// Arguments were not valid for the tool.
    InvalidArguments { name: String, reason: String },
    /// Tool execution failed.
    ExecutionFailed { name: String, reason: String },
    /// The tool panicked.
    Panicked { name: String },
    /// The tool did not finish in time.
    TimedOut { name: String, secs: u64 },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "tool not found: {name}"),
            Self::InvalidArguments { name, reason } => {
                write!(f, "invalid arguments for tool '{name}': {reason}")
            }
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
            Self::Panicked { name } => write!(f, "tool '{name}' crashed"),
            Self::TimedOut { name, secs } => {
                write!(f, "tool '{name}' timed out after {secs}s")
            }
        }
    }
}

impl std::error::Error for ToolError {}

/// Errors from the scoping store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Reading the store failed.
    ReadFailed { reason: String },
    /// Writing the store failed.
    WriteFailed { reason: String },
    /// The stored data could not be decoded.
    Corrupt { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { reason } => write!(f, "scoping store read failed: {reason}"),
            Self::WriteFailed { reason } => write!(f, "scoping store write failed: {reason}"),
            Self::Corrupt { reason } => write!(f, "scoping store is corrupt: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}
