//! Tool plugins available during a conversation turn.
//!
//! The model may request several tool calls in one reply. They are
//! deduplicated, run concurrently, and each produces exactly one tool
//! result message. Tool failures never abort a turn; they are reported to
//! the model as the result text instead.

use crate::error::ToolError;
use async_trait::async_trait;
use chorus_ai::{Message, ToolCall, ToolDefinition};
use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A tool the model can call.
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    /// Returns the declaration sent to the model.
    fn definition(&self) -> ToolDefinition;

    /// Runs the tool and returns the text handed back to the model.
    async fn execute(&self, arguments: JsonValue) -> Result<String, ToolError>;
}

/// Registry of the tools one conversation may use.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    plugins: BTreeMap<String, Arc<dyn ToolPlugin>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its definition name, replacing any previous one.
    pub fn register(&mut self, plugin: Arc<dyn ToolPlugin>) {
        let name = plugin.definition().name;
        self.plugins.insert(name, plugin);
    }

    /// Adds a plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn ToolPlugin>) -> Self {
        self.register(plugin);
        self
    }

    /// Gets a plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolPlugin>> {
        self.plugins.get(name)
    }

    /// Returns all declarations, ordered by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.plugins.values().map(|p| p.definition()).collect()
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Tool calls left after removing duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupedCalls {
    /// Calls to execute, in request order.
    pub calls: Vec<ToolCall>,
    /// Calls dropped because their id was already seen.
    pub duplicate_ids: usize,
    /// Calls dropped because an identical name and arguments pair was already seen.
    pub duplicate_signatures: usize,
}

impl DedupedCalls {
    /// Returns how many calls were dropped.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.duplicate_ids + self.duplicate_signatures
    }
}

/// Removes repeated tool calls.
///
/// A call is dropped if its id was seen before, or if a call with the same
/// name and the same argument text was seen before.
#[must_use]
pub fn dedupe_tool_calls(calls: Vec<ToolCall>) -> DedupedCalls {
    let mut seen_ids = HashSet::new();
    let mut seen_signatures = HashSet::new();
    let mut out = DedupedCalls::default();

    for call in calls {
        if !seen_ids.insert(call.id.clone()) {
            out.duplicate_ids += 1;
            continue;
        }
        let signature = (
            call.function.name.clone(),
            call.function.arguments.trim().to_string(),
        );
        if !seen_signatures.insert(signature) {
            out.duplicate_signatures += 1;
            continue;
        }
        out.calls.push(call);
    }
    out
}

/// Runs every call concurrently and returns one tool result message per call,
/// in the order of `calls`.
pub async fn execute_tool_calls(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    timeout: Duration,
) -> Vec<Message> {
    join_all(calls.iter().map(|call| async move {
        let content = match run_tool_call(registry, call, timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %call.name(), call_id = %call.id, error = %e, "Tool call failed");
                format!("Error: {e}")
            }
        };
        Message::tool(call.id.clone(), content)
    }))
    .await
}

async fn run_tool_call(
    registry: &ToolRegistry,
    call: &ToolCall,
    timeout: Duration,
) -> Result<String, ToolError> {
    let name = call.name().to_string();
    let plugin = registry
        .get(&name)
        .ok_or_else(|| ToolError::NotFound { name: name.clone() })?;
    let arguments = call
        .parse_arguments()
        .map_err(|e| ToolError::InvalidArguments {
            name: name.clone(),
            reason: e.to_string(),
        })?;

    debug!(tool = %name, call_id = %call.id, "Executing tool call");
    let guarded = AssertUnwindSafe(plugin.execute(arguments)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ToolError::Panicked { name }),
        Err(_) => Err(ToolError::TimedOut {
            name,
            secs: timeout.as_secs(),
        }),
    }
}
