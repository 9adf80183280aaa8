//! A single conversation and its turn algorithm.
//!
//! A turn works on a snapshot of the history and writes its result back in
//! one step at the end. A turn that fails or is interrupted before that step
//! leaves the history exactly as it was.
//!
//! Callers must not run two turns of the same conversation at once; the
//! manager enforces this with its per-key lock.

use crate::config::OrchestratorConfig;
use crate::error::{ConversationError, FailureStage};
use crate::key::ConversationKey;
use crate::preset::{Preset, PresetMode};
use crate::sanitize::{cap_messages, sanitize_history, truncate_text};
use crate::tool::{ToolRegistry, dedupe_tool_calls, execute_tool_calls};
use chorus_ai::{
    AskRequest, Capability, Content, ContentPart, Message, MessageRole, ModelSpec, Provider,
    ProviderError, TokenUsage, ToolCall, ToolDefinition,
};
use chorus_core::TurnId;
use chrono::Local;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Instruction sent when the history has to be condensed.
const SUMMARY_INSTRUCTION: &str = "\
Summarize the conversation so far so that it can replace the full history. Follow these rules:
1. Write in the language the user has been using.
2. Keep every fact, name, number, decision and commitment that may matter later.
3. Keep the user's stated preferences and any instructions they gave you.
4. Note open questions and unfinished tasks.
5. Record results of tool calls only where they are still relevant.
6. Do not add anything that was not said, and do not address the user.
Reply with the summary only.";

/// Start of every time marker's text.
const TIME_MARKER_PREFIX: &str = "Current time: ";

/// Kind of a file attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// A picture.
    Image,
    /// A sound clip.
    Audio,
}

impl AttachmentKind {
    /// Returns the model capability needed to send this kind.
    #[must_use]
    pub fn capability(self) -> Capability {
        match self {
            Self::Image => Capability::Vision,
            Self::Audio => Capability::Audio,
        }
    }

    fn noun(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Audio => "audio",
        }
    }
}

/// A file attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// What the file is.
    pub kind: AttachmentKind,
    /// URL or data reference.
    pub reference: String,
}

impl Attachment {
    /// Creates an image attachment.
    #[must_use]
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            reference: reference.into(),
        }
    }

    /// Creates an audio attachment.
    #[must_use]
    pub fn audio(reference: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Audio,
            reference: reference.into(),
        }
    }

    fn to_part(&self) -> ContentPart {
        match self.kind {
            AttachmentKind::Image => ContentPart::image(self.reference.clone()),
            AttachmentKind::Audio => ContentPart::audio(self.reference.clone()),
        }
    }
}

/// What a participant sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    /// Message text.
    pub text: String,
    /// Sender name, shown to the model in group-wide conversations.
    pub display_name: Option<String>,
    /// Attached files.
    pub attachments: Vec<Attachment>,
    /// Whether tools may be offered to the model.
    pub use_tools: bool,
}

impl TurnInput {
    /// Creates a text-only input without tools.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Sets the sender name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the attachments.
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Enables or disables tools.
    #[must_use]
    pub fn with_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }
}

#[derive(Debug, Default)]
struct ConversationState {
    history: Vec<Message>,
    preset: Option<Preset>,
    preset_mode: PresetMode,
    time_marker: Option<String>,
}

/// One dialogue between the assistant and a member or a group.
pub struct Conversation {
    key: ConversationKey,
    config: Arc<OrchestratorConfig>,
    tools: ToolRegistry,
    provider: RwLock<Arc<dyn Provider>>,
    state: Mutex<ConversationState>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("key", &self.key)
            .field("provider", &self.provider.read().name())
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

/// Everything a turn needs, captured when it starts.
struct TurnPlan {
    token: CancellationToken,
    provider: Arc<dyn Provider>,
    history: Vec<Message>,
    preset: Option<Preset>,
    time_marker: Option<String>,
    user: Message,
    use_tools: bool,
}

/// Changes a turn writes back when it commits.
struct TurnCommit {
    history: Vec<Message>,
    appended: Vec<Message>,
    usage: Vec<TokenUsage>,
    summary_tokens: Option<u64>,
    time_marker: Option<String>,
}

#[derive(Debug, Default)]
struct CollectedReply {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
}

enum StreamFailure {
    Interrupted,
    Provider {
        error: ProviderError,
        partial: String,
    },
}

struct Summary {
    text: String,
    tokens: u64,
}

impl Conversation {
    /// Creates an empty conversation.
    #[must_use]
    pub fn new(
        key: ConversationKey,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            key,
            config,
            tools,
            provider: RwLock::new(provider),
            state: Mutex::new(ConversationState::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Sets the initial preset.
    #[must_use]
    pub fn with_preset(self, preset: Preset, mode: PresetMode) -> Self {
        self.set_preset(preset, mode);
        self
    }

    /// Returns the conversation key.
    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Returns a copy of the history.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.state.lock().history.clone()
    }

    /// Returns the number of user messages in the history.
    #[must_use]
    pub fn round(&self) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|m| m.role() == MessageRole::User)
            .count()
    }

    /// Returns the active preset.
    #[must_use]
    pub fn preset(&self) -> Option<Preset> {
        self.state.lock().preset.clone()
    }

    /// Returns where the active preset came from.
    #[must_use]
    pub fn preset_mode(&self) -> PresetMode {
        self.state.lock().preset_mode
    }

    /// Replaces the preset. A running turn keeps the preset it started with.
    pub fn set_preset(&self, preset: Preset, mode: PresetMode) {
        let mut state = self.state.lock();
        state.preset = Some(preset);
        state.preset_mode = mode;
    }

    /// Removes the preset.
    pub fn clear_preset(&self) {
        let mut state = self.state.lock();
        state.preset = None;
        state.preset_mode = PresetMode::Default;
    }

    /// Returns the active provider.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn Provider> {
        Arc::clone(&self.provider.read())
    }

    /// Returns the tools available to this conversation.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Returns the usage of the active provider.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.provider.read().usage()
    }

    /// Swaps the provider, carrying usage over.
    ///
    /// A running turn finishes on the provider it started with.
    pub fn replace_provider(&self, provider: Arc<dyn Provider>) {
        let mut current = self.provider.write();
        provider.usage_counter().restore_from(current.usage_counter());
        info!(key = %self.key, from = %current.name(), to = %provider.name(), "Provider switched");
        *current = provider;
    }

    /// Switches the provider's model after checking it can read the history.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::UnknownModel`] if the provider does not
    /// offer the model, or [`ConversationError::IncompatibleModel`] if the
    /// history uses a capability the model lacks.
    pub fn switch_model(&self, name: &str) -> Result<ModelSpec, ConversationError> {
        let provider = self.provider();
        let target = provider
            .models()
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ConversationError::UnknownModel {
                model: name.to_string(),
            })?;

        let required = required_capabilities(&self.state.lock().history);
        if let Some(capability) = required.into_iter().find(|c| !target.supports(*c)) {
            return Err(ConversationError::IncompatibleModel {
                model: target.name,
                capability,
            });
        }

        let spec = provider.switch_model(name).map_err(|e| match e {
            ProviderError::UnknownModel { model } => ConversationError::UnknownModel { model },
            other => ConversationError::Provider {
                stage: FailureStage::Request,
                reason: other.to_string(),
            },
        })?;
        info!(key = %self.key, model = %spec.name, "Model switched");
        Ok(spec)
    }

    /// Asks the running turn, if any, to stop at its next checkpoint.
    ///
    /// Returns true if a turn was signalled.
    pub fn interrupt(&self) -> bool {
        let token = self.cancel.lock();
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        true
    }

    /// Returns true if the latest turn was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    /// Runs one turn for a new message and returns the assistant's reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, the provider fails, the
    /// history cannot be summarized, or the turn is interrupted.
    pub async fn process_message(&self, input: TurnInput) -> Result<String, ConversationError> {
        let token = self.begin_turn();
        self.process_message_with(token, input).await
    }

    /// Like [`Conversation::process_message`], for a turn already started
    /// with [`Conversation::begin_turn`].
    ///
    /// # Errors
    ///
    /// Same as [`Conversation::process_message`]; an interrupt sent after
    /// `begin_turn` returns [`ConversationError::Interrupted`].
    pub async fn process_message_with(
        &self,
        token: CancellationToken,
        input: TurnInput,
    ) -> Result<String, ConversationError> {
        let provider = self.provider();
        let user = self.user_message(&input, &provider.model())?;

        let (history, preset, time_marker) = self.snapshot();
        self.run_turn(TurnPlan {
            token,
            provider,
            history,
            preset,
            time_marker,
            user,
            use_tools: input.use_tools,
        })
        .await
    }

    /// Re-runs the last answered user message, replacing everything after it.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::NothingToRetry`] if there is no user
    /// message followed by an assistant message, or any error of
    /// [`Conversation::process_message`].
    pub async fn retry(&self, use_tools: bool) -> Result<String, ConversationError> {
        let token = self.begin_turn();
        self.retry_with(token, use_tools).await
    }

    /// Like [`Conversation::retry`], for a turn already started with
    /// [`Conversation::begin_turn`].
    ///
    /// # Errors
    ///
    /// Same as [`Conversation::retry`].
    pub async fn retry_with(
        &self,
        token: CancellationToken,
        use_tools: bool,
    ) -> Result<String, ConversationError> {
        let provider = self.provider();

        let (mut history, preset, time_marker) = self.snapshot();
        let index = history
            .iter()
            .rposition(|m| m.role() == MessageRole::User)
            .ok_or(ConversationError::NothingToRetry)?;
        if !history[index + 1..]
            .iter()
            .any(|m| m.role() == MessageRole::Assistant)
        {
            return Err(ConversationError::NothingToRetry);
        }
        history.truncate(index + 1);
        let user = history.pop().ok_or(ConversationError::NothingToRetry)?;

        debug!(key = %self.key, dropped_from = index, "Retrying last message");
        self.run_turn(TurnPlan {
            token,
            provider,
            history,
            preset,
            time_marker,
            user,
            use_tools,
        })
        .await
    }

    /// Starts a turn and returns its cancellation token.
    ///
    /// [`Conversation::interrupt`] cancels this token until the next turn
    /// begins, even if the turn has not been polled yet.
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    fn snapshot(&self) -> (Vec<Message>, Option<Preset>, Option<String>) {
        let state = self.state.lock();
        (
            state.history.clone(),
            state.preset.clone(),
            state.time_marker.clone(),
        )
    }

    fn interrupted(&self) -> ConversationError {
        ConversationError::Interrupted {
            key: self.key.to_string(),
        }
    }

    fn user_message(
        &self,
        input: &TurnInput,
        model: &ModelSpec,
    ) -> Result<Message, ConversationError> {
        let text = truncate_text(input.text.trim(), self.config.max_input_chars);
        if text.is_empty() && input.attachments.is_empty() {
            return Err(ConversationError::InvalidInput {
                reason: "the message is empty".to_string(),
            });
        }

        let text = match input.display_name.as_deref() {
            Some(name) if self.key.is_group_scoped() && !name.is_empty() => {
                format!("[{name}] {text}")
            }
            _ => text,
        };

        if input.attachments.is_empty() {
            return Ok(Message::user(text));
        }

        let mut parts = Vec::with_capacity(input.attachments.len() + 1);
        if !text.is_empty() {
            parts.push(ContentPart::text(text));
        }
        for attachment in &input.attachments {
            if model.supports(attachment.kind.capability()) {
                parts.push(attachment.to_part());
            } else {
                debug!(model = %model.name, kind = ?attachment.kind, "Dropping unsupported attachment");
                parts.push(ContentPart::text(format!(
                    "(attachment omitted: model does not accept {})",
                    attachment.kind.noun()
                )));
            }
        }
        Ok(Message::user(Content::Parts(parts)))
    }

    fn next_time_marker(&self, last: Option<&str>) -> Option<(String, String)> {
        if !self.config.time_marker {
            return None;
        }
        let now = Local::now();
        let hour = now.format("%Y-%m-%d %H").to_string();
        if last == Some(hour.as_str()) {
            return None;
        }
        let text = format!("{TIME_MARKER_PREFIX}{}", now.format("%Y-%m-%d %H:%M (%A)"));
        Some((hour, text))
    }

    fn needs_summary(&self, provider: &Arc<dyn Provider>, model: &ModelSpec) -> bool {
        let budget = model
            .max_total_tokens
            .saturating_sub(self.config.summary_reserve_tokens);
        provider.context_tokens() > budget
    }

    fn tool_definitions(&self, model: &ModelSpec, use_tools: bool) -> Vec<ToolDefinition> {
        if !use_tools || self.tools.is_empty() {
            return Vec::new();
        }
        if !model.supports_tools {
            debug!(model = %model.name, "Model does not support tools; sending none");
            return Vec::new();
        }
        self.tools.definitions()
    }

    async fn run_turn(&self, plan: TurnPlan) -> Result<String, ConversationError> {
        let turn_id = TurnId::new();
        let span = info_span!("turn", key = %self.key, %turn_id);
        self.run_turn_inner(plan).instrument(span).await
    }

    async fn run_turn_inner(&self, plan: TurnPlan) -> Result<String, ConversationError> {
        let TurnPlan {
            token,
            provider,
            history,
            preset,
            time_marker,
            user,
            use_tools,
        } = plan;

        if token.is_cancelled() {
            return Err(self.interrupted());
        }

        let model = provider.model();
        let marker = self.next_time_marker(time_marker.as_deref());
        let mut history = sanitize_history(&history, self.config.max_content_chars);

        let mut summary_tokens = None;
        if self.needs_summary(&provider, &model) {
            debug!(
                context_tokens = provider.context_tokens(),
                max_total_tokens = model.max_total_tokens,
                "Summarizing history"
            );
            let summary = self
                .summarize(&provider, preset.as_ref(), &history, &token)
                .await?;
            history = vec![Message::assistant(summary.text)];
            summary_tokens = Some(summary.tokens);
        }

        let mut commit = TurnCommit {
            history,
            appended: vec![user],
            usage: Vec::new(),
            summary_tokens,
            time_marker: None,
        };
        if let Some((hour, text)) = marker {
            commit.history.retain(|m| !is_time_marker(m));
            commit.history.push(Message::system(text));
            commit.time_marker = Some(hour);
        }

        let mut outgoing = Vec::with_capacity(commit.history.len() + 2);
        if let Some(preset) = &preset {
            outgoing.push(Message::system(preset.prompt.clone()));
        }
        outgoing.extend(commit.history.iter().cloned());
        outgoing.extend(commit.appended.iter().cloned());
        let outgoing = cap_messages(outgoing, self.config.max_history_messages);

        let tools = self.tool_definitions(&model, use_tools);
        debug!(
            model = %model.name,
            messages = outgoing.len(),
            tools = tools.len(),
            "Sending request"
        );

        let request = AskRequest::new(outgoing.clone()).with_tools(tools);
        let reply = match self.stream_reply(&provider, request, &token).await {
            Ok(reply) => reply,
            Err(StreamFailure::Interrupted) => return Err(self.interrupted()),
            Err(StreamFailure::Provider { error, partial }) => {
                warn!(error = %error, "Provider request failed");
                if !partial.is_empty() {
                    commit.appended.push(Message::assistant(partial));
                    self.commit(&provider, commit, &token);
                }
                return Err(ConversationError::Provider {
                    stage: FailureStage::Request,
                    reason: error.to_string(),
                });
            }
        };
        commit.usage.extend(reply.usage);

        if reply.tool_calls.is_empty() {
            if reply.content.is_empty() {
                return Err(ConversationError::Provider {
                    stage: FailureStage::Request,
                    reason: "the model returned an empty reply".to_string(),
                });
            }
            commit.appended.push(Message::assistant(reply.content.clone()));
            return self.finish(&provider, commit, &token, reply.content);
        }

        let deduped = dedupe_tool_calls(reply.tool_calls);
        if deduped.dropped() > 0 {
            warn!(
                duplicate_ids = deduped.duplicate_ids,
                duplicate_signatures = deduped.duplicate_signatures,
                "Dropped duplicate tool calls"
            );
        }
        let call_message =
            Message::assistant_with_tool_calls(Some(reply.content), deduped.calls.clone())
                .map_err(|e| ConversationError::Provider {
                    stage: FailureStage::Request,
                    reason: e.to_string(),
                })?;

        debug!(calls = deduped.calls.len(), "Executing tool calls");
        let results = tokio::select! {
            biased;
            () = token.cancelled() => return Err(self.interrupted()),
            results = execute_tool_calls(&self.tools, &deduped.calls, self.config.tool_timeout()) => results,
        };
        commit.appended.push(call_message);
        commit.appended.extend(results);

        let mut follow_up = outgoing;
        follow_up.extend(commit.appended.iter().skip(1).cloned());
        match self
            .stream_reply(&provider, AskRequest::new(follow_up), &token)
            .await
        {
            Ok(reply) => {
                commit.usage.extend(reply.usage);
                if !reply.tool_calls.is_empty() {
                    warn!(
                        calls = reply.tool_calls.len(),
                        "Ignoring tool calls in follow-up reply"
                    );
                }
                if reply.content.is_empty() {
                    self.commit(&provider, commit, &token);
                    return Err(ConversationError::Provider {
                        stage: FailureStage::FollowUp,
                        reason: "the model returned an empty reply".to_string(),
                    });
                }
                commit.appended.push(Message::assistant(reply.content.clone()));
                self.finish(&provider, commit, &token, reply.content)
            }
            Err(StreamFailure::Interrupted) => Err(self.interrupted()),
            Err(StreamFailure::Provider { error, partial }) => {
                warn!(error = %error, "Provider follow-up failed");
                if !partial.is_empty() {
                    commit.appended.push(Message::assistant(partial));
                }
                self.commit(&provider, commit, &token);
                Err(ConversationError::Provider {
                    stage: FailureStage::FollowUp,
                    reason: error.to_string(),
                })
            }
        }
    }

    fn finish(
        &self,
        provider: &Arc<dyn Provider>,
        commit: TurnCommit,
        token: &CancellationToken,
        reply: String,
    ) -> Result<String, ConversationError> {
        if self.commit(provider, commit, token) {
            Ok(reply)
        } else {
            Err(self.interrupted())
        }
    }

    /// Writes the turn's changes back unless the turn was interrupted.
    fn commit(
        &self,
        provider: &Arc<dyn Provider>,
        commit: TurnCommit,
        token: &CancellationToken,
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }

        let TurnCommit {
            mut history,
            appended,
            usage,
            summary_tokens,
            time_marker,
        } = commit;
        history.extend(appended);

        let mut state = self.state.lock();
        state.history = history;
        if time_marker.is_some() {
            state.time_marker = time_marker;
        }
        if let Some(tokens) = summary_tokens {
            provider.reset_usage();
            provider.set_total_tokens(tokens);
        }
        for usage in usage {
            provider.usage_counter().record(usage);
        }
        debug!(messages = state.history.len(), "Turn committed");
        true
    }

    async fn summarize(
        &self,
        provider: &Arc<dyn Provider>,
        preset: Option<&Preset>,
        history: &[Message],
        token: &CancellationToken,
    ) -> Result<Summary, ConversationError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(preset) = preset {
            messages.push(Message::system(preset.prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(Message::user(SUMMARY_INSTRUCTION));

        let reply = match self
            .stream_reply(provider, AskRequest::new(messages), token)
            .await
        {
            Ok(reply) => reply,
            Err(StreamFailure::Interrupted) => return Err(self.interrupted()),
            Err(StreamFailure::Provider { error, .. }) => {
                warn!(error = %error, "Summarization failed");
                return Err(ConversationError::CapacityExceeded {
                    reason: error.to_string(),
                });
            }
        };

        let text = reply.content.trim().to_string();
        if text.is_empty() {
            return Err(ConversationError::CapacityExceeded {
                reason: "the summary was empty".to_string(),
            });
        }
        let tokens = reply
            .usage
            .map(|u| u.completion_tokens)
            .filter(|t| *t > 0)
            .unwrap_or_else(|| estimate_tokens(&text));
        info!(tokens, "History summarized");
        Ok(Summary { text, tokens })
    }

    async fn stream_reply(
        &self,
        provider: &Arc<dyn Provider>,
        request: AskRequest,
        token: &CancellationToken,
    ) -> Result<CollectedReply, StreamFailure> {
        if token.is_cancelled() {
            return Err(StreamFailure::Interrupted);
        }

        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => return Err(StreamFailure::Interrupted),
            started = provider.ask(request) => started.map_err(|error| StreamFailure::Provider {
                error,
                partial: String::new(),
            })?,
        };

        let mut reply = CollectedReply::default();
        loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => return Err(StreamFailure::Interrupted),
                item = stream.next() => item,
            };
            match item {
                None => return Ok(reply),
                Some(Ok(chunk)) => {
                    if let Some(content) = chunk.content {
                        reply.content.push_str(&content);
                    }
                    reply.tool_calls.extend(chunk.tool_calls);
                    if chunk.usage.is_some() {
                        reply.usage = chunk.usage;
                    }
                }
                Some(Err(error)) => {
                    return Err(StreamFailure::Provider {
                        error,
                        partial: reply.content,
                    });
                }
            }
        }
    }
}

/// Returns the capabilities a model needs to read `history`.
fn required_capabilities(history: &[Message]) -> Vec<Capability> {
    let mut required = Vec::new();
    if history.iter().any(Message::involves_tools) {
        required.push(Capability::Tools);
    }
    if history.iter().any(Message::has_image) {
        required.push(Capability::Vision);
    }
    if history.iter().any(Message::has_audio) {
        required.push(Capability::Audio);
    }
    required
}

fn is_time_marker(message: &Message) -> bool {
    message.is_system() && message.text().starts_with(TIME_MARKER_PREFIX)
}

/// Rough token count for text without provider-reported usage.
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::LockScope;
    use async_trait::async_trait;
    use chorus_ai::{ReplyChunk, ReplyStream, UsageCounter};
    use std::collections::VecDeque;

    type Script = Result<Vec<Result<ReplyChunk, ProviderError>>, ProviderError>;

    /// Provider replaying canned replies and recording every request.
    struct ScriptedProvider {
        model: Mutex<ModelSpec>,
        models: Vec<ModelSpec>,
        replies: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<AskRequest>>,
        usage: UsageCounter,
    }

    impl ScriptedProvider {
        fn new(model: ModelSpec) -> Self {
            Self {
                models: vec![model.clone()],
                model: Mutex::new(model),
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                usage: UsageCounter::new(),
            }
        }

        fn with_models(mut self, models: Vec<ModelSpec>) -> Self {
            self.models.extend(models);
            self
        }

        fn reply(self, chunks: Vec<ReplyChunk>) -> Self {
            self.replies
                .lock()
                .push_back(Ok(chunks.into_iter().map(Ok).collect()));
            self
        }

        fn script(self, script: Script) -> Self {
            self.replies.lock().push_back(script);
            self
        }

        fn requests(&self) -> Vec<AskRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
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
            let script = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![Ok(ReplyChunk::text("(no script)"))]));
            Ok(futures::stream::iter(script?).boxed())
        }

        fn usage_counter(&self) -> &UsageCounter {
            &self.usage
        }
    }

    fn config() -> Arc<OrchestratorConfig> {
        Arc::new(OrchestratorConfig {
            time_marker: false,
            ..OrchestratorConfig::default()
        })
    }

    fn conversation(provider: Arc<ScriptedProvider>) -> Conversation {
        Conversation::new(
            ConversationKey::new("global-u1", LockScope::User),
            provider,
            ToolRegistry::new(),
            config(),
        )
    }

    #[tokio::test]
    async fn simple_turn_commits_pair() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 8192))
                .reply(vec![ReplyChunk::text("h"), ReplyChunk::text("i")]),
        );
        let conversation = conversation(Arc::clone(&provider));

        let reply = conversation
            .process_message(TurnInput::new("hello"))
            .await
            .expect("turn");

        assert_eq!(reply, "hi");
        assert_eq!(
            conversation.history(),
            vec![Message::user("hello"), Message::assistant("hi")]
        );
        assert_eq!(conversation.round(), 1);
    }

    #[tokio::test]
    async fn preset_is_sent_but_not_stored() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 8192)).reply(vec![ReplyChunk::text("meow")]),
        );
        let conversation = conversation(Arc::clone(&provider))
            .with_preset(Preset::named("cat", "You are a cat."), PresetMode::Default);

        conversation
            .process_message(TurnInput::new("hi"))
            .await
            .expect("turn");

        let requests = provider.requests();
        assert_eq!(requests[0].messages[0], Message::system("You are a cat."));
        assert!(conversation.history().iter().all(|m| !m.is_system()));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = conversation(Arc::clone(&provider));
        let err = conversation
            .process_message(TurnInput::new("   "))
            .await
            .expect_err("empty");
        assert!(matches!(err, ConversationError::InvalidInput { .. }));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn long_input_is_truncated() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = Conversation::new(
            ConversationKey::new("global-u1", LockScope::User),
            Arc::clone(&provider) as Arc<dyn Provider>,
            ToolRegistry::new(),
            Arc::new(OrchestratorConfig {
                time_marker: false,
                max_input_chars: 5,
                ..OrchestratorConfig::default()
            }),
        );
        conversation
            .process_message(TurnInput::new("abcdefghij"))
            .await
            .expect("turn");
        assert_eq!(
            conversation.history()[0].text(),
            format!("abcde\n{}", crate::sanitize::TRUNCATION_MARKER)
        );
    }

    #[tokio::test]
    async fn display_name_only_in_group_scope() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let shared = Conversation::new(
            ConversationKey::new("g1", LockScope::Group),
            Arc::clone(&provider) as Arc<dyn Provider>,
            ToolRegistry::new(),
            config(),
        );
        shared
            .process_message(TurnInput::new("hi").with_display_name("Alice"))
            .await
            .expect("turn");
        assert_eq!(shared.history()[0].text(), "[Alice] hi");

        let single = conversation(Arc::clone(&provider));
        single
            .process_message(TurnInput::new("hi").with_display_name("Alice"))
            .await
            .expect("turn");
        assert_eq!(single.history()[0].text(), "hi");
    }

    #[tokio::test]
    async fn unsupported_attachment_becomes_note() {
        let provider = Arc::new(ScriptedProvider::new(
            ModelSpec::new("m", 8192).with_vision(),
        ));
        let conversation = conversation(Arc::clone(&provider));
        conversation
            .process_message(TurnInput::new("what is this").with_attachments(vec![
                Attachment::image("https://example.com/a.png"),
                Attachment::audio("https://example.com/a.ogg"),
            ]))
            .await
            .expect("turn");

        assert_eq!(
            conversation.history()[0],
            Message::user(Content::Parts(vec![
                ContentPart::text("what is this"),
                ContentPart::image("https://example.com/a.png"),
                ContentPart::text("(attachment omitted: model does not accept audio)"),
            ]))
        );
    }

    #[tokio::test]
    async fn stream_error_keeps_history_without_partial() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 8192)).script(Err(
                ProviderError::Unavailable {
                    provider: "scripted".to_string(),
                    reason: "down".to_string(),
                },
            )),
        );
        let conversation = conversation(Arc::clone(&provider));
        let err = conversation
            .process_message(TurnInput::new("hello"))
            .await
            .expect_err("provider down");

        assert!(matches!(
            err,
            ConversationError::Provider {
                stage: FailureStage::Request,
                ..
            }
        ));
        assert!(conversation.history().is_empty());
    }

    #[tokio::test]
    async fn stream_error_commits_partial_content() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)).script(Ok(
            vec![
                Ok(ReplyChunk::text("par")),
                Err(ProviderError::StreamFailed {
                    reason: "reset".to_string(),
                }),
            ],
        )));
        let conversation = conversation(Arc::clone(&provider));
        conversation
            .process_message(TurnInput::new("hello"))
            .await
            .expect_err("stream failed");

        assert_eq!(
            conversation.history(),
            vec![Message::user("hello"), Message::assistant("par")]
        );
    }

    #[tokio::test]
    async fn idle_interrupt_does_not_carry_into_next_turn() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = conversation(Arc::clone(&provider));
        // nothing running yet
        assert!(conversation.interrupt());
        assert!(!conversation.interrupt());

        conversation
            .process_message(TurnInput::new("hello"))
            .await
            .expect("turn");
        assert!(!conversation.is_interrupted());
    }

    #[tokio::test]
    async fn interrupt_after_begin_cancels_unpolled_turn() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = conversation(Arc::clone(&provider));
        conversation.state.lock().history = vec![Message::user("old"), Message::assistant("reply")];

        let token = conversation.begin_turn();
        assert!(conversation.interrupt());

        let err = conversation
            .process_message_with(token, TurnInput::new("hello"))
            .await
            .expect_err("interrupted");
        assert!(matches!(err, ConversationError::Interrupted { .. }));
        assert_eq!(
            conversation.history(),
            vec![Message::user("old"), Message::assistant("reply")]
        );
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn summary_replaces_history_and_resets_usage() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 4096))
                .reply(vec![
                    ReplyChunk::text("SUMMARY").with_usage(TokenUsage::new(3990, 42)),
                ])
                .reply(vec![ReplyChunk::text("answer")]),
        );
        provider.usage_counter().record(TokenUsage::new(4096 - 100, 10));
        let conversation = conversation(Arc::clone(&provider));
        {
            let mut state = conversation.state.lock();
            state.history = vec![Message::user("old"), Message::assistant("reply")];
        }

        conversation
            .process_message(TurnInput::new("new"))
            .await
            .expect("turn");

        assert_eq!(
            conversation.history(),
            vec![
                Message::assistant("SUMMARY"),
                Message::user("new"),
                Message::assistant("answer"),
            ]
        );
        assert_eq!(conversation.usage().total_tokens, 42);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].messages.last(),
            Some(&Message::user(SUMMARY_INSTRUCTION))
        );
        assert!(requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn turns_under_budget_are_not_summarized() {
        let mut provider = ScriptedProvider::new(ModelSpec::new("m", 8192));
        for i in 0..4 {
            provider = provider.reply(vec![
                ReplyChunk::text(format!("a{i}")).with_usage(TokenUsage::new(3000, 10)),
            ]);
        }
        let provider = Arc::new(provider);
        let conversation = conversation(Arc::clone(&provider));

        for i in 0..4 {
            let reply = conversation
                .process_message(TurnInput::new(format!("q{i}")))
                .await
                .expect("turn");
            assert_eq!(reply, format!("a{i}"));
        }

        assert_eq!(conversation.history().len(), 8);
        assert_eq!(conversation.usage().prompt_tokens, 12_000);
        assert_eq!(provider.context_tokens(), 3000);
        assert!(provider.requests().iter().all(|r| {
            r.messages.last() != Some(&Message::user(SUMMARY_INSTRUCTION))
        }));
    }

    #[tokio::test]
    async fn failed_summary_is_capacity_error() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 4096)).script(Err(
                ProviderError::RequestFailed {
                    reason: "context too long".to_string(),
                },
            )),
        );
        provider.usage_counter().record(TokenUsage::new(4096, 0));
        let conversation = conversation(Arc::clone(&provider));
        {
            conversation.state.lock().history = vec![Message::user("old")];
        }

        let err = conversation
            .process_message(TurnInput::new("new"))
            .await
            .expect_err("capacity");
        assert!(matches!(err, ConversationError::CapacityExceeded { .. }));
        assert_eq!(conversation.history(), vec![Message::user("old")]);
        assert_eq!(conversation.usage().prompt_tokens, 4096);
    }

    #[tokio::test]
    async fn retry_replaces_last_answer() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("m", 8192))
                .reply(vec![ReplyChunk::text("first")])
                .reply(vec![ReplyChunk::text("second")]),
        );
        let conversation = conversation(Arc::clone(&provider));
        conversation
            .process_message(TurnInput::new("question"))
            .await
            .expect("turn");

        let reply = conversation.retry(false).await.expect("retry");
        assert_eq!(reply, "second");
        assert_eq!(
            conversation.history(),
            vec![Message::user("question"), Message::assistant("second")]
        );
    }

    #[tokio::test]
    async fn retry_without_answer_fails() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = conversation(Arc::clone(&provider));
        assert_eq!(
            conversation.retry(false).await.expect_err("empty"),
            ConversationError::NothingToRetry
        );
    }

    #[tokio::test]
    async fn switch_model_checks_history() {
        let provider = Arc::new(
            ScriptedProvider::new(ModelSpec::new("big", 8192).with_tools())
                .with_models(vec![ModelSpec::new("small", 2048)]),
        );
        let conversation = conversation(Arc::clone(&provider));
        {
            let call = Message::assistant_with_tool_calls(
                None,
                vec![ToolCall::new("t1", "echo", "{}")],
            )
            .expect("call");
            conversation.state.lock().history =
                vec![Message::user("q"), call, Message::tool("t1", "r")];
        }

        let err = conversation.switch_model("small").expect_err("incompatible");
        assert_eq!(
            err,
            ConversationError::IncompatibleModel {
                model: "small".to_string(),
                capability: Capability::Tools,
            }
        );
        assert!(matches!(
            conversation.switch_model("huge"),
            Err(ConversationError::UnknownModel { .. })
        ));

        conversation.state.lock().history.clear();
        let spec = conversation.switch_model("small").expect("switch");
        assert_eq!(spec.name, "small");
        assert_eq!(provider.model().name, "small");
    }

    #[tokio::test]
    async fn replace_provider_carries_usage() {
        let old = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        old.usage_counter().record(TokenUsage::new(100, 20));
        let conversation = conversation(Arc::clone(&old));

        let new = Arc::new(ScriptedProvider::new(ModelSpec::new("n", 8192)));
        conversation.replace_provider(Arc::clone(&new) as Arc<dyn Provider>);
        assert_eq!(new.usage(), TokenUsage::new(100, 20));
        assert_eq!(conversation.provider().model().name, "n");
    }

    #[tokio::test]
    async fn time_marker_inserted_once_per_hour() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = Conversation::new(
            ConversationKey::new("global-u1", LockScope::User),
            Arc::clone(&provider) as Arc<dyn Provider>,
            ToolRegistry::new(),
            Arc::new(OrchestratorConfig::default()),
        );
        conversation
            .process_message(TurnInput::new("one"))
            .await
            .expect("turn");
        conversation
            .process_message(TurnInput::new("two"))
            .await
            .expect("turn");

        let history = conversation.history();
        assert_eq!(history.iter().filter(|m| is_time_marker(m)).count(), 1);
        assert_eq!(history.iter().filter(|m| !m.is_system()).count(), 4);
    }

    #[tokio::test]
    async fn new_time_marker_replaces_stale_ones() {
        let provider = Arc::new(ScriptedProvider::new(ModelSpec::new("m", 8192)));
        let conversation = Conversation::new(
            ConversationKey::new("global-u1", LockScope::User),
            Arc::clone(&provider) as Arc<dyn Provider>,
            ToolRegistry::new(),
            Arc::new(OrchestratorConfig::default()),
        );
        {
            let mut state = conversation.state.lock();
            for hour in 0..70 {
                state.history.push(Message::system(format!(
                    "{TIME_MARKER_PREFIX}2000-01-01 {hour:02}:00"
                )));
                state.history.push(Message::user(format!("q{hour}")));
                state.history.push(Message::assistant(format!("a{hour}")));
            }
            state.time_marker = Some("2000-01-01 00".to_string());
        }

        conversation
            .process_message(TurnInput::new("now"))
            .await
            .expect("turn");

        let history = conversation.history();
        let markers: Vec<_> = history.iter().filter(|m| is_time_marker(m)).collect();
        assert_eq!(markers.len(), 1);
        assert!(!markers[0].text().contains("2000-01-01"));
        assert_eq!(history.iter().filter(|m| !m.is_system()).count(), 142);

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent.len(), OrchestratorConfig::default().max_history_messages);
        assert_eq!(sent.iter().filter(|m| m.is_system()).count(), 1);
        assert_eq!(sent.last(), Some(&Message::user("now")));
    }
}
