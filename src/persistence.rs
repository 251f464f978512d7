//! Two-phase durable message store.
//!
//! Records live in one of two partitions keyed by message id:
//!
//! ```text
//! {store}/pending/{id}.json     saved, not yet fully delivered
//! {store}/processed/{id}.json   delivered, kept for audit
//! ```
//!
//! On startup the bus reloads every pending record and re-enqueues it, which
//! gives at-least-once delivery across crashes. Processed records are never
//! replayed.
//!
//! Writes go to a sibling `.tmp` file first and are renamed into place, so a
//! crash mid-write never leaves a torn JSON document behind.

use crate::constants::{PENDING_DIR, PROCESSED_DIR};
use crate::error::{Error, Result};
use crate::message::{Message, MessageId, MessageType, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// =============================================================================
// FILTER
// =============================================================================

/// Header predicates for [`MessagePersistence::list`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub priority: Option<Priority>,
    pub message_type: Option<MessageType>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    /// Only messages stamped at or after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Only messages stamped strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Also enumerate the processed partition.
    pub include_processed: bool,
}

impl MessageFilter {
    /// Matches every pending record.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Matches every record in both partitions.
    pub fn all() -> Self {
        Self {
            include_processed: true,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self.before = Some(before);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        let h = &message.header;
        self.priority.map_or(true, |p| h.priority == p)
            && self.message_type.map_or(true, |t| h.message_type == t)
            && self.source.as_deref().map_or(true, |s| h.source == s)
            && self.target.as_deref().map_or(true, |t| h.target == t)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| h.session_id.as_deref() == Some(s))
            && self.after.map_or(true, |a| h.timestamp >= a)
            && self.before.map_or(true, |b| h.timestamp < b)
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Storage backend used by the bus for durable messages.
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    /// Write `message` into the pending partition, replacing any earlier copy.
    async fn save(&self, message: &Message) -> Result<()>;

    /// Read a record, checking pending first, then processed.
    async fn load(&self, message_id: &str) -> Result<Option<Message>>;

    /// Remove a record from both partitions. Returns whether anything was removed.
    async fn delete(&self, message_id: &str) -> Result<bool>;

    /// Ids of records matching `filter`, oldest first.
    async fn list(&self, filter: &MessageFilter) -> Result<Vec<MessageId>>;

    /// Move a record from pending to processed. Returns false if it was not pending.
    async fn mark_as_processed(&self, message_id: &str) -> Result<bool>;

    /// Every pending record, oldest first.
    async fn load_pending(&self) -> Result<Vec<Message>>;

    /// Drop processed records stamped before `older_than`. Returns how many were removed.
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.header
            .timestamp
            .cmp(&b.header.timestamp)
            .then_with(|| a.header.message_id.cmp(&b.header.message_id))
    });
}

// =============================================================================
// FILE SYSTEM BACKEND
// =============================================================================

/// File-backed store with one JSON document per message.
#[derive(Debug)]
pub struct FileSystemPersistence {
    root: PathBuf,
    locks: Mutex<HashMap<MessageId, Arc<Mutex<()>>>>,
}

impl FileSystemPersistence {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for partition in [PENDING_DIR, PROCESSED_DIR] {
            let dir = root.join(partition);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::directory_create_error(dir.display().to_string(), e))?;
        }
        debug!(root = %root.display(), "Opened message store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, partition: &str, message_id: &str) -> Result<PathBuf> {
        if message_id.is_empty()
            || message_id.contains(['/', '\\'])
            || message_id.starts_with('.')
        {
            return Err(Error::invalid_message(format!(
                "message id '{}' cannot be used as a record name",
                message_id
            )));
        }
        Ok(self
            .root
            .join(partition)
            .join(format!("{}.json", message_id)))
    }

    async fn lock_for(&self, message_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(message_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry for `message_id` once no other caller holds or
    /// awaits `lock`. The caller's guard must already be released.
    async fn release_lock(&self, message_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(message_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(message_id);
        }
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::file_write_error(tmp.display().to_string(), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::file_write_error(path.display().to_string(), e))
    }

    async fn move_to_processed(pending: &Path, processed: &Path) -> Result<bool> {
        let Some(bytes) = Self::read_record(pending).await? else {
            return Ok(false);
        };
        Self::write_atomic(processed, &bytes).await?;
        Self::remove_if_present(pending).await?;
        Ok(true)
    }

    async fn remove_everywhere(pending: &Path, processed: &Path) -> Result<bool> {
        let a = Self::remove_if_present(pending).await?;
        let b = Self::remove_if_present(processed).await?;
        Ok(a || b)
    }

    async fn read_record(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_read_error(path.display().to_string(), e)),
        }
    }

    async fn remove_if_present(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_write_error(path.display().to_string(), e)),
        }
    }

    /// Parse every record in a partition. Unreadable documents are skipped.
    async fn scan(&self, partition: &str) -> Result<Vec<(PathBuf, Message)>> {
        let dir = self.root.join(partition);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::file_read_error(dir.display().to_string(), e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::file_read_error(dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(bytes) = Self::read_record(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<Message>(&bytes) {
                Ok(message) => records.push((path, message)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MessagePersistence for FileSystemPersistence {
    async fn save(&self, message: &Message) -> Result<()> {
        let path = self.record_path(PENDING_DIR, message.id())?;
        let bytes = serde_json::to_vec_pretty(message)?;

        let lock = self.lock_for(message.id()).await;
        let written = {
            let _guard = lock.lock().await;
            Self::write_atomic(&path, &bytes).await
        };
        self.release_lock(message.id(), lock).await;
        written?;
        debug!(message_id = %message.id(), "Persisted message");
        Ok(())
    }

    async fn load(&self, message_id: &str) -> Result<Option<Message>> {
        for partition in [PENDING_DIR, PROCESSED_DIR] {
            let path = self.record_path(partition, message_id)?;
            if let Some(bytes) = Self::read_record(&path).await? {
                return Ok(Some(serde_json::from_slice(&bytes)?));
            }
        }
        Ok(None)
    }

    async fn delete(&self, message_id: &str) -> Result<bool> {
        let pending = self.record_path(PENDING_DIR, message_id)?;
        let processed = self.record_path(PROCESSED_DIR, message_id)?;

        let lock = self.lock_for(message_id).await;
        let removed = {
            let _guard = lock.lock().await;
            Self::remove_everywhere(&pending, &processed).await
        };
        self.release_lock(message_id, lock).await;
        removed
    }

    async fn list(&self, filter: &MessageFilter) -> Result<Vec<MessageId>> {
        let mut matched: Vec<Message> = self
            .scan(PENDING_DIR)
            .await?
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| filter.matches(m))
            .collect();
        if filter.include_processed {
            matched.extend(
                self.scan(PROCESSED_DIR)
                    .await?
                    .into_iter()
                    .map(|(_, m)| m)
                    .filter(|m| filter.matches(m)),
            );
        }
        sort_by_timestamp(&mut matched);
        Ok(matched.into_iter().map(|m| m.header.message_id).collect())
    }

    async fn mark_as_processed(&self, message_id: &str) -> Result<bool> {
        let pending = self.record_path(PENDING_DIR, message_id)?;
        let processed = self.record_path(PROCESSED_DIR, message_id)?;

        let lock = self.lock_for(message_id).await;
        let moved = {
            let _guard = lock.lock().await;
            Self::move_to_processed(&pending, &processed).await
        };
        self.release_lock(message_id, lock).await;
        let moved = moved?;

        if moved {
            debug!(message_id, "Record moved to processed");
        }
        Ok(moved)
    }

    async fn load_pending(&self) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .scan(PENDING_DIR)
            .await?
            .into_iter()
            .map(|(_, m)| m)
            .collect();
        sort_by_timestamp(&mut messages);
        Ok(messages)
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for (path, message) in self.scan(PROCESSED_DIR).await? {
            if message.header.timestamp < older_than && Self::remove_if_present(&path).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

#[derive(Debug, Default)]
struct Partitions {
    pending: HashMap<MessageId, Message>,
    processed: HashMap<MessageId, Message>,
}

/// Volatile store with the same two-phase semantics. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    inner: Mutex<Partitions>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessagePersistence for InMemoryPersistence {
    async fn save(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .pending
            .insert(message.header.message_id.clone(), message.clone());
        Ok(())
    }

    async fn load(&self, message_id: &str) -> Result<Option<Message>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pending
            .get(message_id)
            .or_else(|| inner.processed.get(message_id))
            .cloned())
    }

    async fn delete(&self, message_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let a = inner.pending.remove(message_id).is_some();
        let b = inner.processed.remove(message_id).is_some();
        Ok(a || b)
    }

    async fn list(&self, filter: &MessageFilter) -> Result<Vec<MessageId>> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<Message> = inner
            .pending
            .values()
            .chain(
                inner
                    .processed
                    .values()
                    .filter(|_| filter.include_processed),
            )
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_by_timestamp(&mut matched);
        Ok(matched.into_iter().map(|m| m.header.message_id).collect())
    }

    async fn mark_as_processed(&self, message_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.pending.remove(message_id) {
            Some(message) => {
                inner.processed.insert(message_id.to_string(), message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_pending(&self) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner.pending.values().cloned().collect();
        sort_by_timestamp(&mut messages);
        Ok(messages)
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.processed.len();
        inner
            .processed
            .retain(|_, m| m.header.timestamp >= older_than);
        Ok(before - inner.processed.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================
