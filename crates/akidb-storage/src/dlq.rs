//! Dead Letter Queue (DLQ) - Persistent queue for permanently failed uploads
//!
//! The DLQ stores upload tasks that hit a permanent error or exhausted their
//! retry budget. Entries are never retried automatically; an operator moves
//! them back into the upload queue through the requeue admin path.
//!
//! It provides:
//! - Size limit enforcement with FIFO eviction
//! - TTL-based expiration
//! - Persistence to `<data_dir>/dlq/<collection_id>.json`
//! - Metrics

use crate::upload::UploadTask;
use akidb_core::{CollectionId, CoreError, CoreResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// DLQ configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DLQConfig {
    /// Maximum number of entries (default: 10,000)
    pub max_size: usize,
    /// Time-to-live in seconds (default: 604,800 = 7 days)
    pub ttl_seconds: i64,
    /// Cleanup interval in seconds (default: 3,600 = 1 hour)
    pub cleanup_interval_seconds: u64,
}

impl Default for DLQConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl_seconds: 604_800, // 7 days
            cleanup_interval_seconds: 3600,
        }
    }
}

impl DLQConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_size == 0 {
            return Err(CoreError::ValidationError(
                "dlq.max_size must be greater than 0".to_string(),
            ));
        }
        if self.ttl_seconds <= 0 {
            return Err(CoreError::ValidationError(
                "dlq.ttl_seconds must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(CoreError::ValidationError(
                "dlq.cleanup_interval_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// DLQ entry with TTL and the task needed to requeue it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DLQEntry {
    pub id: Uuid,
    pub collection_id: CollectionId,
    /// Object key the task was writing or deleting
    pub object_key: String,
    pub task: UploadTask,
    /// Error message from the last failure
    pub error_message: String,
    /// Failed attempts before the entry was dead-lettered
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DLQEntry {
    #[must_use]
    pub fn new(task: UploadTask, error_message: String, retry_count: u32, ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            collection_id: task.collection_id,
            object_key: task.object_key(),
            task,
            error_message,
            retry_count,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl_seconds),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    #[must_use]
    pub fn age(&self) -> ChronoDuration {
        Utc::now() - self.created_at
    }
}

/// DLQ metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct DLQMetrics {
    pub size: usize,
    /// Age of oldest entry in seconds
    pub oldest_entry_age_seconds: i64,
    /// Entries evicted due to the size limit
    pub total_evictions: u64,
    /// Expired entries removed
    pub total_expired: u64,
    /// Entries moved back to the upload queue
    pub total_requeued: u64,
    /// Entries dropped because a newer mutation of the object was queued
    pub total_superseded: u64,
}

/// Dead Letter Queue of one collection
///
/// # Examples
///
/// ```rust,no_run
/// use akidb_storage::dlq::{DeadLetterQueue, DLQConfig, DLQEntry};
/// use akidb_storage::upload::UploadTask;
/// use akidb_core::{CollectionId, DocumentId};
///
/// #[tokio::main]
/// async fn main() -> akidb_core::CoreResult<()> {
///     let collection_id: CollectionId = "018f2a1e-0000-7000-8000-000000000000".parse().unwrap();
///     let dlq = DeadLetterQueue::new(collection_id, DLQConfig::default(), "./dlq/c.json");
///
///     let task = UploadTask::delete(collection_id, DocumentId::new());
///     dlq.add_entry(DLQEntry::new(task, "403 Forbidden".to_string(), 1, 604_800))?;
///
///     println!("DLQ size: {}", dlq.metrics().size);
///     dlq.persist().await
/// }
/// ```
pub struct DeadLetterQueue {
    collection_id: CollectionId,
    entries: RwLock<VecDeque<DLQEntry>>,
    config: DLQConfig,
    persistence_path: PathBuf,
    metrics: RwLock<DLQMetrics>,
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        config: DLQConfig,
        persistence_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            collection_id,
            entries: RwLock::new(VecDeque::new()),
            config,
            persistence_path: persistence_path.into(),
            metrics: RwLock::new(DLQMetrics::default()),
        }
    }

    /// Opens the DLQ and loads any entries persisted by a previous run.
    ///
    /// # Errors
    ///
    /// Returns error if the persisted file exists but cannot be read or parsed
    pub async fn open(
        collection_id: CollectionId,
        config: DLQConfig,
        persistence_path: impl Into<PathBuf>,
    ) -> CoreResult<Self> {
        let dlq = Self::new(collection_id, config, persistence_path);
        dlq.load_from_disk().await?;
        Ok(dlq)
    }

    pub fn config(&self) -> &DLQConfig {
        &self.config
    }

    pub fn persistence_path(&self) -> &Path {
        &self.persistence_path
    }

    /// Adds an entry, evicting the oldest one when the queue is full.
    ///
    /// # Errors
    ///
    /// `CoreError::ValidationError` if the entry belongs to another collection
    pub fn add_entry(&self, entry: DLQEntry) -> CoreResult<()> {
        if entry.collection_id != self.collection_id {
            return Err(CoreError::ValidationError(format!(
                "DLQ of collection {} cannot hold an entry of collection {}",
                self.collection_id, entry.collection_id
            )));
        }

        let mut entries = self.entries.write();

        if entries.len() >= self.config.max_size {
            if let Some(evicted) = entries.pop_front() {
                tracing::warn!(
                    collection_id = %self.collection_id,
                    key = %evicted.object_key,
                    "DLQ size limit reached, evicted oldest entry"
                );
            }
            self.metrics.write().total_evictions += 1;
        }

        entries.push_back(entry);
        self.metrics.write().size = entries.len();

        Ok(())
    }

    #[must_use]
    pub fn get_entry(&self, id: &Uuid) -> Option<DLQEntry> {
        self.entries.read().iter().find(|e| &e.id == id).cloned()
    }

    /// Removes and returns an entry for requeueing.
    pub fn take_entry(&self, id: &Uuid) -> Option<DLQEntry> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| &e.id == id)?;
        let entry = entries.remove(pos);

        let mut metrics = self.metrics.write();
        metrics.size = entries.len();
        if entry.is_some() {
            metrics.total_requeued += 1;
        }
        entry
    }

    /// Removes and returns every entry for requeueing, oldest first.
    pub fn take_all(&self) -> Vec<DLQEntry> {
        let mut entries = self.entries.write();
        let taken: Vec<DLQEntry> = entries.drain(..).collect();

        let mut metrics = self.metrics.write();
        metrics.size = 0;
        metrics.total_requeued += taken.len() as u64;
        taken
    }

    pub fn remove_entry(&self, id: &Uuid) {
        let mut entries = self.entries.write();
        if let Some(pos) = entries.iter().position(|e| &e.id == id) {
            entries.remove(pos);
        }
        self.metrics.write().size = entries.len();
    }

    /// Drops every entry for `object_key`. Returns how many were dropped.
    ///
    /// Called when a newer mutation of the same object is queued, which
    /// makes the dead-lettered ones obsolete.
    pub fn remove_for_key(&self, object_key: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.object_key != object_key);
        let removed = before - entries.len();
        if removed > 0 {
            let mut metrics = self.metrics.write();
            metrics.size = entries.len();
            metrics.total_superseded += removed as u64;
        }
        removed
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() >= self.config.max_size
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let initial_size = entries.len();

        entries.retain(|entry| !entry.is_expired());

        let expired_count = initial_size - entries.len();

        let mut metrics = self.metrics.write();
        metrics.size = entries.len();
        metrics.total_expired += expired_count as u64;

        if expired_count > 0 {
            tracing::info!(
                collection_id = %self.collection_id,
                expired = expired_count,
                "DLQ cleanup removed expired entries"
            );
        }

        expired_count
    }

    /// Persist DLQ to disk
    ///
    /// # Errors
    ///
    /// Returns error if file I/O fails or serialization fails
    pub async fn persist(&self) -> CoreResult<()> {
        // Clone entries to avoid holding lock across await
        let entries_clone = self.entries.read().clone();

        if let Some(parent) = self.persistence_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::StorageError(format!("Failed to create DLQ directory: {e}"))
            })?;
        }

        let json = serde_json::to_string_pretty(&entries_clone)
            .map_err(|e| CoreError::SerializationError(format!("Failed to serialize DLQ: {e}")))?;

        // Write-then-rename so a crash never leaves a half-written file
        let tmp_path = self.persistence_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| CoreError::StorageError(format!("Failed to write DLQ file: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.persistence_path)
            .await
            .map_err(|e| CoreError::StorageError(format!("Failed to write DLQ file: {e}")))?;

        tracing::debug!(
            collection_id = %self.collection_id,
            entries = entries_clone.len(),
            "DLQ persisted"
        );

        Ok(())
    }

    /// Load DLQ from disk, dropping expired entries
    ///
    /// # Errors
    ///
    /// Returns error if file I/O fails or deserialization fails
    pub async fn load_from_disk(&self) -> CoreResult<()> {
        if !tokio::fs::try_exists(&self.persistence_path).await? {
            tracing::debug!(
                collection_id = %self.collection_id,
                "DLQ persistence file not found, starting with empty queue"
            );
            return Ok(());
        }

        let json = tokio::fs::read_to_string(&self.persistence_path)
            .await
            .map_err(|e| CoreError::StorageError(format!("Failed to read DLQ file: {e}")))?;

        let loaded_entries: VecDeque<DLQEntry> = serde_json::from_str(&json).map_err(|e| {
            CoreError::DeserializationError(format!("Failed to deserialize DLQ: {e}"))
        })?;

        let valid_entries: VecDeque<DLQEntry> = loaded_entries
            .into_iter()
            .filter(|e| !e.is_expired() && e.collection_id == self.collection_id)
            .collect();

        let loaded_count = valid_entries.len();
        *self.entries.write() = valid_entries;
        self.metrics.write().size = loaded_count;

        tracing::info!(
            collection_id = %self.collection_id,
            entries = loaded_count,
            "DLQ loaded from disk"
        );

        Ok(())
    }

    #[must_use]
    pub fn metrics(&self) -> DLQMetrics {
        let entries = self.entries.read();
        let mut metrics = self.metrics.read().clone();

        metrics.size = entries.len();
        metrics.oldest_entry_age_seconds =
            entries.front().map(|e| e.age().num_seconds()).unwrap_or(0);

        metrics
    }

    /// All entries, oldest first (for inspection)
    #[must_use]
    pub fn all_entries(&self) -> Vec<DLQEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Clear all entries (admin operation)
    pub fn clear(&self) {
        self.entries.write().clear();
        self.metrics.write().size = 0;
    }
}
