//! Offline provider and tool used by the console.
//!
//! The echo provider repeats the last message back, word by word, and asks
//! for the `clock` tool when the user mentions the time.

use async_trait::async_trait;
use chorus_ai::{
    AskRequest, Message, ModelSpec, Provider, ProviderError, ReplyChunk, ReplyStream, TokenUsage,
    ToolCall, ToolDefinition, UsageCounter,
};
use chorus_conversation::{
    ConversationError, ConversationKey, ProviderFactory, ToolError, ToolPlugin,
};
use chrono::Local;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Providers the console knows.
pub const PROVIDERS: [&str; 2] = ["echo", "shout"];

fn models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("echo-small", 2048),
        ModelSpec::new("echo-large", 32_768)
            .with_tools()
            .with_vision()
            .with_audio(),
    ]
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Provider that echoes instead of calling a model.
pub struct EchoProvider {
    name: String,
    model: Mutex<ModelSpec>,
    usage: UsageCounter,
    next_call: AtomicU64,
}

impl EchoProvider {
    /// Creates an echo provider; `shout` upper-cases its replies.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let model = models()
            .into_iter()
            .last()
            .unwrap_or_else(|| ModelSpec::new("echo-small", 2048));
        Self {
            name: name.into(),
            model: Mutex::new(model),
            usage: UsageCounter::new(),
            next_call: AtomicU64::new(1),
        }
    }

    fn reply_for(&self, request: &AskRequest) -> ReplyChunk {
        let Some(last) = request.messages.last() else {
            return ReplyChunk::text("...");
        };
        match last {
            Message::Tool { content, .. } => {
                ReplyChunk::text(self.voice(&format!("The clock says {content}.")))
            }
            _ if !request.tools.is_empty() && last.text().to_lowercase().contains("time") => {
                let id = format!("call_{}", self.next_call.fetch_add(1, Ordering::SeqCst));
                ReplyChunk::tool_calls(vec![ToolCall::new(id, "clock", "{}")])
            }
            _ => ReplyChunk::text(self.voice(&last.text())),
        }
    }

    fn voice(&self, text: &str) -> String {
        if self.name == "shout" {
            text.to_uppercase()
        } else {
            text.to_string()
        }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> ModelSpec {
        self.model.lock().clone()
    }

    fn models(&self) -> Vec<ModelSpec> {
        models()
    }

    fn switch_model(&self, name: &str) -> Result<ModelSpec, ProviderError> {
        let spec = models()
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ProviderError::UnknownModel {
                model: name.to_string(),
            })?;
        *self.model.lock() = spec.clone();
        Ok(spec)
    }

    async fn ask(&self, request: AskRequest) -> Result<ReplyStream, ProviderError> {
        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.text()))
            .sum();
        let reply = self.reply_for(&request);
        let completion_tokens = reply.content.as_deref().map_or(1, estimate_tokens);
        let usage = TokenUsage::new(prompt_tokens, completion_tokens);

        let mut chunks: Vec<Result<ReplyChunk, ProviderError>> = match &reply.content {
            Some(text) => text
                .split_inclusive(' ')
                .map(|word| Ok(ReplyChunk::text(word)))
                .collect(),
            None => vec![Ok(reply.clone())],
        };
        chunks.push(Ok(ReplyChunk::default().with_usage(usage)));
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn usage_counter(&self) -> &UsageCounter {
        &self.usage
    }
}

/// Builds echo providers by name.
#[derive(Debug, Default)]
pub struct EchoFactory;

impl ProviderFactory for EchoFactory {
    fn create(
        &self,
        _key: &ConversationKey,
        name: Option<&str>,
    ) -> Result<Arc<dyn Provider>, ConversationError> {
        let name = name.unwrap_or(PROVIDERS[0]);
        if !PROVIDERS.contains(&name) {
            return Err(ConversationError::UnknownProvider {
                name: name.to_string(),
            });
        }
        Ok(Arc::new(EchoProvider::new(name)))
    }
}

/// Tool reporting the local time.
#[derive(Debug, Default)]
pub struct ClockTool;

#[async_trait]
impl ToolPlugin for ClockTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("clock", "Returns the current local time")
    }

    async fn execute(&self, _arguments: JsonValue) -> Result<String, ToolError> {
        Ok(Local::now().format("%H:%M").to_string())
    }
}
