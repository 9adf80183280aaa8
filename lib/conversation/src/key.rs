//! Conversation keys and the scoping table that decides them.
//!
//! A group is either `Default` (each member talks to the assistant alone,
//! following their user mode) or `Shared` (the whole group is one
//! conversation). A member's user mode decides whether their conversation
//! follows them across groups (`Global`) or stays in each group
//! (`Independent`).

use chorus_core::{GroupId, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How a group partitions conversations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Defer to each member's user mode.
    #[default]
    Default,
    /// One conversation for the whole group.
    Shared,
}

/// How a member's conversations are partitioned across groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    /// One conversation that follows the member everywhere.
    #[default]
    Global,
    /// A separate conversation in every group.
    Independent,
}

/// Which locks a turn must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Only the conversation lock.
    User,
    /// The conversation lock and the group lock.
    Group,
}

/// Identity of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    id: String,
    lock_scope: LockScope,
}

impl ConversationKey {
    /// Creates a key.
    #[must_use]
    pub fn new(id: impl Into<String>, lock_scope: LockScope) -> Self {
        Self {
            id: id.into(),
            lock_scope,
        }
    }

    /// Key of a group-wide conversation.
    #[must_use]
    pub fn shared(group: &GroupId) -> Self {
        Self::new(group.as_str(), LockScope::Group)
    }

    /// Key of a member's conversation that follows them across groups.
    #[must_use]
    pub fn global(member: &MemberId) -> Self {
        Self::new(format!("global-{member}"), LockScope::User)
    }

    /// Key of a member's conversation within one group.
    #[must_use]
    pub fn independent(group: &GroupId, member: &MemberId) -> Self {
        Self::new(format!("{group}-{member}"), LockScope::User)
    }

    /// Returns the key string.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the lock scope.
    #[must_use]
    pub fn lock_scope(&self) -> LockScope {
        self.lock_scope
    }

    /// Returns true if turns must also hold the group lock.
    #[must_use]
    pub fn is_group_scoped(&self) -> bool {
        self.lock_scope == LockScope::Group
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Scoping configuration of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupScoping {
    /// The group's mode; absent means the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_mode: Option<GroupMode>,
    /// Per-member overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_modes: BTreeMap<MemberId, UserMode>,
}

/// Persisted scoping configuration for every group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopingTable {
    groups: BTreeMap<GroupId, GroupScoping>,
}

impl ScopingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the explicit mode of a group, if any.
    #[must_use]
    pub fn group_mode(&self, group: &GroupId) -> Option<GroupMode> {
        self.groups.get(group).and_then(|g| g.group_mode)
    }

    /// Returns the explicit mode of a member in a group, if any.
    #[must_use]
    pub fn user_mode(&self, group: &GroupId, member: &MemberId) -> Option<UserMode> {
        self.groups
            .get(group)
            .and_then(|g| g.user_modes.get(member).copied())
    }

    /// Sets a group's mode. Returns true if the table changed.
    pub fn set_group_mode(&mut self, group: &GroupId, mode: GroupMode) -> bool {
        let entry = self.groups.entry(group.clone()).or_default();
        let changed = entry.group_mode != Some(mode);
        entry.group_mode = Some(mode);
        changed
    }

    /// Sets a member's mode in a group. Returns true if the table changed.
    pub fn set_user_mode(&mut self, group: &GroupId, member: &MemberId, mode: UserMode) -> bool {
        let entry = self.groups.entry(group.clone()).or_default();
        entry.user_modes.insert(member.clone(), mode) != Some(mode)
    }

    /// Returns the number of configured groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns whether no group is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Fallback modes for unconfigured groups and members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopingDefaults {
    /// Mode of groups absent from the table.
    pub group_mode: GroupMode,
    /// Mode of members absent from the table.
    pub user_mode: UserMode,
}

/// Maps a (group, member) pair to a conversation key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationKeyResolver {
    defaults: ScopingDefaults,
}

impl ConversationKeyResolver {
    /// Creates a resolver with the given fallbacks.
    #[must_use]
    pub fn new(defaults: ScopingDefaults) -> Self {
        Self { defaults }
    }

    /// Returns the effective group mode.
    #[must_use]
    pub fn group_mode(&self, table: &ScopingTable, group: &GroupId) -> GroupMode {
        table
            .group_mode(group)
            .unwrap_or(self.defaults.group_mode)
    }

    /// Returns the effective user mode.
    #[must_use]
    pub fn user_mode(&self, table: &ScopingTable, group: &GroupId, member: &MemberId) -> UserMode {
        table
            .user_mode(group, member)
            .unwrap_or(self.defaults.user_mode)
    }

    /// Resolves the key for a message from `member` in `group`.
    #[must_use]
    pub fn resolve(
        &self,
        table: &ScopingTable,
        group: &GroupId,
        member: &MemberId,
    ) -> ConversationKey {
        match self.group_mode(table, group) {
            GroupMode::Shared => ConversationKey::shared(group),
            GroupMode::Default => match self.user_mode(table, group, member) {
                UserMode::Global => ConversationKey::global(member),
                UserMode::Independent => ConversationKey::independent(group, member),
            },
        }
    }
}
