//! Registry of conversations and the entry point for chat platforms.
//!
//! The manager resolves which conversation a message belongs to, makes sure
//! at most one turn runs per conversation (and per group for group-wide
//! conversations), and creates conversations on first use.

use crate::config::OrchestratorConfig;
use crate::conversation::{Attachment, Conversation, TurnInput};
use crate::error::ConversationError;
use crate::key::{ConversationKey, GroupMode, UserMode};
use crate::preset::{Preset, PresetCatalog, PresetMode, PresetSelection};
use crate::scoping::ScopingRegistry;
use crate::tool::ToolRegistry;
use chorus_ai::{Message, ModelSpec, Provider, TokenUsage};
use chorus_core::{GroupId, MemberId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Builds providers for conversations.
pub trait ProviderFactory: Send + Sync {
    /// Creates a provider for `key`. `name` selects a specific provider;
    /// `None` means the default one.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::UnknownProvider`] if `name` is not known.
    fn create(
        &self,
        key: &ConversationKey,
        name: Option<&str>,
    ) -> std::result::Result<Arc<dyn Provider>, ConversationError>;
}

/// Builds the tool set of a conversation.
pub trait PluginsFactory: Send + Sync {
    /// Creates the tools available to `key`.
    fn create(&self, key: &ConversationKey) -> ToolRegistry;
}

/// Every conversation gets the same tools.
impl PluginsFactory for ToolRegistry {
    fn create(&self, _key: &ConversationKey) -> ToolRegistry {
        self.clone()
    }
}

/// A message from a chat platform.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Where the message was posted.
    pub group: GroupId,
    /// Who posted it.
    pub member: MemberId,
    /// The poster's display name.
    pub display_name: String,
    /// Message text.
    pub text: String,
    /// Attached files.
    pub files: Vec<Attachment>,
    /// Whether tools may be used.
    pub use_tools: bool,
}

impl SendRequest {
    /// Creates a text message without tools.
    #[must_use]
    pub fn new(group: GroupId, member: MemberId, text: impl Into<String>) -> Self {
        Self {
            display_name: member.to_string(),
            group,
            member,
            text: text.into(),
            files: Vec::new(),
            use_tools: false,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Sets the attachments.
    #[must_use]
    pub fn with_files(mut self, files: Vec<Attachment>) -> Self {
        self.files = files;
        self
    }

    /// Enables or disables tools.
    #[must_use]
    pub fn with_tools(mut self, use_tools: bool) -> Self {
        self.use_tools = use_tools;
        self
    }
}

/// Locks held for the duration of one turn.
struct TurnGuard {
    _key: OwnedMutexGuard<()>,
    _group: Option<OwnedMutexGuard<()>>,
}

/// Map of lazily created turn locks.
struct LockTable<K> {
    locks: Mutex<HashMap<K, Arc<TurnLock<()>>>>,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<TurnLock<()>> {
        Arc::clone(self.locks.lock().entry(key.clone()).or_default())
    }

    /// Takes the lock without waiting.
    fn try_acquire(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(key).try_lock_owned().ok()
    }

    fn is_held(&self, key: &K) -> bool {
        self.locks
            .lock()
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn remove(&self, key: &K) {
        self.locks.lock().remove(key);
    }
}

/// Owns every conversation and routes platform messages to them.
pub struct ConversationManager {
    config: Arc<OrchestratorConfig>,
    presets: PresetCatalog,
    scoping: ScopingRegistry,
    providers: Arc<dyn ProviderFactory>,
    plugins: Arc<dyn PluginsFactory>,
    conversations: Mutex<HashMap<ConversationKey, Arc<Conversation>>>,
    key_locks: LockTable<ConversationKey>,
    group_locks: LockTable<GroupId>,
}

impl ConversationManager {
    /// Creates a manager. Presets come from `config`.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        scoping: ScopingRegistry,
        providers: Arc<dyn ProviderFactory>,
        plugins: Arc<dyn PluginsFactory>,
    ) -> Self {
        let presets = PresetCatalog::from_config(&config);
        Self {
            config: Arc::new(config),
            presets,
            scoping,
            providers,
            plugins,
            conversations: Mutex::new(HashMap::new()),
            key_locks: LockTable::new(),
            group_locks: LockTable::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns the preset catalog.
    #[must_use]
    pub fn presets(&self) -> &PresetCatalog {
        &self.presets
    }

    /// Returns the key a message from `member` in `group` maps to.
    #[must_use]
    pub fn resolve_key(&self, group: &GroupId, member: &MemberId) -> ConversationKey {
        self.scoping.resolve(group, member)
    }

    /// Returns the conversation for `member` in `group`, if it exists.
    #[must_use]
    pub fn conversation(&self, group: &GroupId, member: &MemberId) -> Option<Arc<Conversation>> {
        let key = self.resolve_key(group, member);
        self.conversations.lock().get(&key).cloned()
    }

    /// Runs a turn for a platform message and returns the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::Busy`] if a turn is already running for
    /// the conversation or its group, and any error of the turn itself.
    #[instrument(skip_all, fields(group = %request.group, member = %request.member))]
    pub async fn send(&self, request: SendRequest) -> Result<String, ConversationError> {
        Ok(self.run_send(request).await?)
    }

    /// Like [`ConversationManager::send`], turning errors into reply text.
    pub async fn respond(&self, request: SendRequest) -> String {
        match self.run_send(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "Turn failed");
                e.reply_text()
            }
        }
    }

    async fn run_send(&self, request: SendRequest) -> std::result::Result<String, ConversationError> {
        let key = self.resolve_key(&request.group, &request.member);
        let _guard = self.acquire(&key, &request.group)?;
        let (conversation, token) = self.get_or_create(&key)?;

        let input = TurnInput::new(request.text)
            .with_display_name(request.display_name)
            .with_attachments(request.files)
            .with_tools(request.use_tools);
        let reply = conversation.process_message_with(token, input).await?;
        debug!(key = %key, "Reply ready");
        Ok(reply)
    }

    /// Re-runs the last answered message of the conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::Busy`] if a turn is running,
    /// [`ConversationError::NothingToRetry`] if there is nothing to retry,
    /// and any error of the turn itself.
    #[instrument(skip(self))]
    pub async fn retry(
        &self,
        group: &GroupId,
        member: &MemberId,
        use_tools: bool,
    ) -> Result<String, ConversationError> {
        let key = self.resolve_key(group, member);
        let _guard = self.acquire(&key, group)?;
        let (conversation, token) = self
            .check_out(&key)
            .ok_or(ConversationError::NothingToRetry)?;
        Ok(conversation.retry_with(token, use_tools).await?)
    }

    /// Starts a fresh conversation, replacing any existing one.
    ///
    /// A turn still running on the replaced conversation is interrupted and
    /// its result is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset is unknown or no provider can be built.
    #[instrument(skip(self))]
    pub fn new_conversation(
        &self,
        group: &GroupId,
        member: &MemberId,
        preset: Option<PresetSelection>,
    ) -> Result<Arc<Conversation>, ConversationError> {
        let key = self.resolve_key(group, member);
        let preset = match preset {
            Some(selection) => Some(self.presets.select(&selection)?),
            None => None,
        };
        let conversation = Arc::new(self.build(&key, preset)?);

        let replaced = self
            .conversations
            .lock()
            .insert(key.clone(), Arc::clone(&conversation));
        if let Some(old) = replaced {
            if self.key_locks.is_held(&key) && old.interrupt() {
                info!(key = %key, "Interrupted running turn of replaced conversation");
            }
        }
        info!(key = %key, "Conversation started");
        Ok(conversation)
    }

    /// Deletes the conversation. Returns false if there was none.
    pub fn remove(&self, group: &GroupId, member: &MemberId) -> bool {
        let key = self.resolve_key(group, member);
        let removed = self.conversations.lock().remove(&key);
        self.key_locks.remove(&key);
        match removed {
            Some(conversation) => {
                conversation.interrupt();
                info!(key = %key, "Conversation removed");
                true
            }
            None => false,
        }
    }

    /// Asks a running turn to stop. Returns false if there is nothing to stop.
    pub fn interrupt(&self, group: &GroupId, member: &MemberId) -> bool {
        let key = self.resolve_key(group, member);
        if !self.key_locks.is_held(&key) {
            return false;
        }
        self.existing(&key).is_ok_and(|c| c.interrupt())
    }

    /// Replaces the preset of an existing conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::NotFound`] if there is no conversation,
    /// or a preset selection error.
    pub fn set_preset(
        &self,
        group: &GroupId,
        member: &MemberId,
        selection: &PresetSelection,
    ) -> Result<Preset, ConversationError> {
        let conversation = self.existing(&self.resolve_key(group, member))?;
        let (preset, mode) = self.presets.select(selection)?;
        conversation.set_preset(preset.clone(), mode);
        Ok(preset)
    }

    /// Returns the preset of the conversation, if any.
    #[must_use]
    pub fn get_preset(&self, group: &GroupId, member: &MemberId) -> Option<(Preset, PresetMode)> {
        let conversation = self.conversation(group, member)?;
        let preset = conversation.preset()?;
        Some((preset, conversation.preset_mode()))
    }

    /// Removes the preset of an existing conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::NotFound`] if there is no conversation.
    pub fn clear_preset(&self, group: &GroupId, member: &MemberId) -> Result<(), ConversationError> {
        self.existing(&self.resolve_key(group, member))?
            .clear_preset();
        Ok(())
    }

    /// Moves an existing conversation to another provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::NotFound`] if there is no conversation,
    /// or [`ConversationError::UnknownProvider`] from the factory.
    pub fn switch_provider(
        &self,
        group: &GroupId,
        member: &MemberId,
        name: &str,
    ) -> Result<(), ConversationError> {
        let key = self.resolve_key(group, member);
        let conversation = self.existing(&key)?;
        let provider = self.providers.create(&key, Some(name))?;
        conversation.replace_provider(provider);
        Ok(())
    }

    /// Switches the model of an existing conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::NotFound`] if there is no conversation,
    /// [`ConversationError::UnknownModel`] or
    /// [`ConversationError::IncompatibleModel`].
    pub fn switch_model(
        &self,
        group: &GroupId,
        member: &MemberId,
        model: &str,
    ) -> Result<ModelSpec, ConversationError> {
        let conversation = self.existing(&self.resolve_key(group, member))?;
        Ok(conversation.switch_model(model)?)
    }

    /// Returns the history of the conversation; empty if there is none.
    #[must_use]
    pub fn history(&self, group: &GroupId, member: &MemberId) -> Vec<Message> {
        self.conversation(group, member)
            .map(|c| c.history())
            .unwrap_or_default()
    }

    /// Returns the usage of the conversation's provider, if it exists.
    #[must_use]
    pub fn usage(&self, group: &GroupId, member: &MemberId) -> Option<TokenUsage> {
        self.conversation(group, member).map(|c| c.usage())
    }

    /// Returns the usage summed over every conversation.
    #[must_use]
    pub fn total_usage(&self) -> TokenUsage {
        let conversations: Vec<_> = self.conversations.lock().values().cloned().collect();
        conversations.iter().map(|c| c.usage()).sum()
    }

    /// Returns the number of user messages in the conversation.
    #[must_use]
    pub fn round(&self, group: &GroupId, member: &MemberId) -> usize {
        self.conversation(group, member).map_or(0, |c| c.round())
    }

    /// Returns the number of live conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    /// Returns whether there are no conversations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.lock().is_empty()
    }

    /// Returns the effective mode of a group.
    #[must_use]
    pub fn group_mode(&self, group: &GroupId) -> GroupMode {
        self.scoping.group_mode(group)
    }

    /// Returns the effective mode of a member in a group.
    #[must_use]
    pub fn user_mode(&self, group: &GroupId, member: &MemberId) -> UserMode {
        self.scoping.user_mode(group, member)
    }

    /// Sets a group's mode. New messages resolve with it immediately.
    pub fn update_group_mode(&self, group: &GroupId, mode: GroupMode) {
        self.scoping.update_group_mode(group, mode);
    }

    /// Sets a member's mode in a group.
    pub fn update_user_mode(&self, group: &GroupId, member: &MemberId, mode: UserMode) {
        self.scoping.update_user_mode(group, member, mode);
    }

    /// Writes pending scoping changes now.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn flush_scoping(&self) -> Result<(), crate::error::StoreError> {
        Ok(self.scoping.flush().await?)
    }

    fn acquire(
        &self,
        key: &ConversationKey,
        group: &GroupId,
    ) -> std::result::Result<TurnGuard, ConversationError> {
        let busy = || ConversationError::Busy {
            key: key.to_string(),
        };
        let key_guard = self.key_locks.try_acquire(key).ok_or_else(busy)?;
        let group_guard = if key.is_group_scoped() {
            Some(self.group_locks.try_acquire(group).ok_or_else(busy)?)
        } else {
            None
        };
        Ok(TurnGuard {
            _key: key_guard,
            _group: group_guard,
        })
    }

    fn existing(
        &self,
        key: &ConversationKey,
    ) -> std::result::Result<Arc<Conversation>, ConversationError> {
        self.conversations
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| ConversationError::NotFound {
                key: key.to_string(),
            })
    }

    /// Looks up the conversation and begins a turn on it.
    ///
    /// The turn begins under the map lock, so a `new_conversation` that
    /// replaces the entry afterwards always interrupts this turn.
    fn check_out(&self, key: &ConversationKey) -> Option<(Arc<Conversation>, CancellationToken)> {
        let conversations = self.conversations.lock();
        let conversation = conversations.get(key)?;
        Some((Arc::clone(conversation), conversation.begin_turn()))
    }

    fn get_or_create(
        &self,
        key: &ConversationKey,
    ) -> std::result::Result<(Arc<Conversation>, CancellationToken), ConversationError> {
        if let Some(found) = self.check_out(key) {
            return Ok(found);
        }
        let built = Arc::new(self.build(key, None)?);
        let mut conversations = self.conversations.lock();
        let conversation = conversations.entry(key.clone()).or_insert(built);
        let token = conversation.begin_turn();
        debug!(key = %key, "Conversation created");
        Ok((Arc::clone(conversation), token))
    }

    fn build(
        &self,
        key: &ConversationKey,
        preset: Option<(Preset, PresetMode)>,
    ) -> std::result::Result<Conversation, ConversationError> {
        let provider = self.providers.create(key, None)?;
        let tools = self.plugins.create(key);
        let conversation = Conversation::new(key.clone(), provider, tools, Arc::clone(&self.config));
        let preset = preset.or_else(|| {
            self.presets
                .default_preset()
                .map(|p| (p, PresetMode::Default))
        });
        Ok(match preset {
            Some((preset, mode)) => conversation.with_preset(preset, mode),
            None => conversation,
        })
    }
}
