//! Stubs shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chorus_ai::{
    AskRequest, ModelSpec, Provider, ProviderError, ReplyChunk, ReplyStream, TokenUsage, ToolCall,
    ToolDefinition, UsageCounter,
};
use chorus_conversation::{
    ConversationError, ConversationKey, ConversationKeyResolver, ConversationManager,
    InMemoryScopingStore, OrchestratorConfig, ProviderFactory, ScopingRegistry, ToolError,
    ToolPlugin, ToolRegistry,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub type Script = Result<Vec<Result<ReplyChunk, ProviderError>>, ProviderError>;

/// Pauses a provider inside `ask` until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Provider replaying canned replies and recording every request.
pub struct StubProvider {
    name: String,
    model: Mutex<ModelSpec>,
    models: Vec<ModelSpec>,
    replies: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<AskRequest>>,
    usage: UsageCounter,
    gate: Option<Arc<Gate>>,
}

impl StubProvider {
    pub fn new(name: &str, model: ModelSpec) -> Self {
        Self {
            name: name.to_string(),
            models: vec![model.clone()],
            model: Mutex::new(model),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            usage: UsageCounter::new(),
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_usage(self, usage: TokenUsage) -> Self {
        self.usage.record(usage);
        self
    }

    pub fn reply_text(self, text: &str) -> Self {
        self.script(Ok(vec![Ok(ReplyChunk::text(text))]))
    }

    pub fn reply_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.script(Ok(vec![Ok(ReplyChunk::tool_calls(calls))]))
    }

    pub fn script(self, script: Script) -> Self {
        self.replies.lock().push_back(script);
        self
    }

    pub fn requests(&self) -> Vec<AskRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> ModelSpec {
        self.model.lock().clone()
    }

    fn models(&self) -> Vec<ModelSpec> {
        self.models.clone()
    }

    fn switch_model(&self, name: &str) -> Result<ModelSpec, ProviderError> {
        let spec = self
            .models
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownModel {
                model: name.to_string(),
            })?;
        *self.model.lock() = spec.clone();
        Ok(spec)
    }

    async fn ask(&self, request: AskRequest) -> Result<ReplyStream, ProviderError> {
        self.requests.lock().push(request);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let script = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![Ok(ReplyChunk::text("ok"))]));
        Ok(futures::stream::iter(script?).boxed())
    }

    fn usage_counter(&self) -> &UsageCounter {
        &self.usage
    }
}

type Build = Box<dyn Fn(&str) -> StubProvider + Send + Sync>;

/// Factory knowing the providers `stub` (default) and `other`.
pub struct StubFactory {
    build: Build,
    created: Mutex<Vec<Arc<StubProvider>>>,
}

impl StubFactory {
    pub fn new(build: impl Fn(&str) -> StubProvider + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every provider gets the same single reply.
    pub fn replying(text: &'static str) -> Self {
        Self::new(move |name| StubProvider::new(name, model()).reply_text(text))
    }

    pub fn created(&self) -> Vec<Arc<StubProvider>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<StubProvider> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("a provider was created")
    }
}

impl ProviderFactory for StubFactory {
    fn create(
        &self,
        _key: &ConversationKey,
        name: Option<&str>,
    ) -> Result<Arc<dyn Provider>, ConversationError> {
        let name = name.unwrap_or("stub");
        if name != "stub" && name != "other" {
            return Err(ConversationError::UnknownProvider {
                name: name.to_string(),
            });
        }
        let provider = Arc::new((self.build)(name));
        self.created.lock().push(Arc::clone(&provider));
        Ok(provider)
    }
}

/// Tool returning its arguments.
#[derive(Default)]
pub struct EchoTool {
    pub calls: AtomicUsize,
}

impl EchoTool {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolPlugin for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("echo", "Echo the arguments back")
    }

    async fn execute(&self, arguments: JsonValue) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(arguments.to_string())
    }
}

/// Tool that waits at a gate before answering.
pub struct GatedTool {
    pub gate: Arc<Gate>,
}

#[async_trait]
impl ToolPlugin for GatedTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("wait", "Wait for the gate")
    }

    async fn execute(&self, _arguments: JsonValue) -> Result<String, ToolError> {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        Ok("released".to_string())
    }
}

pub fn model() -> ModelSpec {
    ModelSpec::new("stub-1", 8192).with_tools()
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        time_marker: false,
        ..OrchestratorConfig::default()
    }
}

pub async fn manager_with(
    config: OrchestratorConfig,
    factory: Arc<StubFactory>,
    tools: ToolRegistry,
    store: Arc<InMemoryScopingStore>,
) -> ConversationManager {
    let scoping = ScopingRegistry::load(
        store,
        ConversationKeyResolver::new(config.scoping_defaults()),
        Duration::from_secs(60),
    )
    .await
    .expect("load scoping");
    ConversationManager::new(config, scoping, factory, Arc::new(tools))
}

pub async fn manager(factory: Arc<StubFactory>) -> ConversationManager {
    manager_with(
        config(),
        factory,
        ToolRegistry::new(),
        Arc::new(InMemoryScopingStore::new()),
    )
    .await
}
