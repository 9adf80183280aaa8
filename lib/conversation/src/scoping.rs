//! Scoping persistence and the registry that serves key lookups.
//!
//! Mode changes apply to the in-memory table immediately and are written to
//! the store by a background task after a short quiet period, so a burst of
//! changes costs one write.

use crate::error::StoreError;
use crate::key::{ConversationKey, ConversationKeyResolver, GroupMode, ScopingTable, UserMode};
use async_trait::async_trait;
use chorus_core::{GroupId, MemberId};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Durable storage for the scoping table.
#[async_trait]
pub trait ScopingStore: Send + Sync {
    /// Loads the table. A store that has never been written yields an empty table.
    async fn load(&self) -> Result<ScopingTable, StoreError>;

    /// Replaces the stored table.
    async fn save(&self, table: &ScopingTable) -> Result<(), StoreError>;
}

/// Store kept in memory, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryScopingStore {
    table: Mutex<ScopingTable>,
    saves: AtomicUsize,
}

impl InMemoryScopingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `table`.
    #[must_use]
    pub fn with_table(table: ScopingTable) -> Self {
        Self {
            table: Mutex::new(table),
            saves: AtomicUsize::new(0),
        }
    }

    /// Returns the stored table.
    #[must_use]
    pub fn table(&self) -> ScopingTable {
        self.table.lock().clone()
    }

    /// Returns how many times the table was saved.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScopingStore for InMemoryScopingStore {
    async fn load(&self) -> Result<ScopingTable, StoreError> {
        Ok(self.table.lock().clone())
    }

    async fn save(&self, table: &ScopingTable) -> Result<(), StoreError> {
        *self.table.lock() = table.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store backed by a pretty-printed JSON file.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// target, so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct JsonFileScopingStore {
    path: PathBuf,
}

impl JsonFileScopingStore {
    /// Creates a store for `path`. The file need not exist.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "scoping.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ScopingStore for JsonFileScopingStore {
    async fn load(&self) -> Result<ScopingTable, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScopingTable::new());
            }
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    reason: format!("{}: {e}", self.path.display()),
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            reason: format!("{}: {e}", self.path.display()),
        })
    }

    async fn save(&self, table: &ScopingTable) -> Result<(), StoreError> {
        let write_failed = |e: std::io::Error| StoreError::WriteFailed {
            reason: format!("{}: {e}", self.path.display()),
        };

        let json = serde_json::to_vec_pretty(table).map_err(|e| StoreError::WriteFailed {
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await.map_err(write_failed)?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(write_failed)
    }
}

struct RegistryInner {
    table: RwLock<ScopingTable>,
    resolver: ConversationKeyResolver,
    store: Arc<dyn ScopingStore>,
    dirty: AtomicBool,
    changed: Notify,
    // One save at a time; the file store reuses a single temporary path.
    saving: AsyncMutex<()>,
}

impl RegistryInner {
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.changed.notify_one();
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let _saving = self.saving.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.table.read().clone();
        if let Err(e) = self.store.save(&snapshot).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(groups = snapshot.len(), "Flushed scoping table");
        Ok(())
    }
}

/// Serves conversation keys from the scoping table and persists mode changes.
pub struct ScopingRegistry {
    inner: Arc<RegistryInner>,
    flusher: JoinHandle<()>,
}

impl ScopingRegistry {
    /// Loads the table from `store` and starts the flush task.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the store error if the table cannot be loaded.
    pub async fn load(
        store: Arc<dyn ScopingStore>,
        resolver: ConversationKeyResolver,
        debounce: Duration,
    ) -> Result<Self, StoreError> {
        let table = store.load().await?;
        debug!(groups = table.len(), "Loaded scoping table");

        let inner = Arc::new(RegistryInner {
            table: RwLock::new(table),
            resolver,
            store,
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
            saving: AsyncMutex::new(()),
        });
        let flusher = tokio::spawn(run_flusher(Arc::clone(&inner), debounce));
        Ok(Self { inner, flusher })
    }

    /// Resolves the conversation key for `member` in `group`.
    #[must_use]
    pub fn resolve(&self, group: &GroupId, member: &MemberId) -> ConversationKey {
        self.inner
            .resolver
            .resolve(&self.inner.table.read(), group, member)
    }

    /// Returns the effective mode of a group.
    #[must_use]
    pub fn group_mode(&self, group: &GroupId) -> GroupMode {
        self.inner
            .resolver
            .group_mode(&self.inner.table.read(), group)
    }

    /// Returns the effective mode of a member in a group.
    #[must_use]
    pub fn user_mode(&self, group: &GroupId, member: &MemberId) -> UserMode {
        self.inner
            .resolver
            .user_mode(&self.inner.table.read(), group, member)
    }

    /// Sets a group's mode and schedules a flush.
    pub fn update_group_mode(&self, group: &GroupId, mode: GroupMode) {
        let changed = self.inner.table.write().set_group_mode(group, mode);
        if changed {
            debug!(group = %group, ?mode, "Group mode updated");
            self.inner.mark_dirty();
        }
    }

    /// Sets a member's mode in a group and schedules a flush.
    pub fn update_user_mode(&self, group: &GroupId, member: &MemberId, mode: UserMode) {
        let changed = self
            .inner
            .table
            .write()
            .set_user_mode(group, member, mode);
        if changed {
            debug!(group = %group, member = %member, ?mode, "User mode updated");
            self.inner.mark_dirty();
        }
    }

    /// Writes pending changes now.
    ///
    /// # Errors
    ///
    /// Returns the store error; the changes stay pending.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await
    }

    /// Returns a copy of the current table.
    #[must_use]
    pub fn snapshot(&self) -> ScopingTable {
        self.inner.table.read().clone()
    }
}

impl Drop for ScopingRegistry {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

async fn run_flusher(inner: Arc<RegistryInner>, debounce: Duration) {
    loop {
        inner.changed.notified().await;
        // Let a burst of changes settle into one write.
        tokio::time::sleep(debounce).await;
        if let Err(e) = inner.flush().await {
            warn!(error = %e, "Failed to flush scoping table");
        }
    }
}
