//! Write-Ahead Log for per-collection durability
//!
//! Every mutation is appended (and fsync'd) before the caller's write is
//! acknowledged. Each entry carries a monotonically increasing Log Sequence
//! Number (LSN) that orders replay and anchors snapshots.

mod file_wal;

pub use file_wal::{FileWAL, FileWALConfig};

use akidb_core::{CollectionId, CoreError, CoreResult, DocumentId, VectorDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Log Sequence Number - monotonically increasing identifier for WAL entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogSequenceNumber(u64);

impl LogSequenceNumber {
    /// Zero LSN (before the first entry)
    pub const ZERO: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the following LSN.
    ///
    /// # Errors
    ///
    /// Fails instead of wrapping once `u64::MAX` is reached, since a wrapped
    /// LSN would break replay ordering.
    pub fn next(&self) -> CoreResult<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| CoreError::invalid_state("LSN space exhausted"))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

impl From<u64> for LogSequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogSequenceNumber> for u64 {
    fn from(lsn: LogSequenceNumber) -> Self {
        lsn.0
    }
}

/// WAL entry types - all operations that modify a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// Insert or update a vector document
    Upsert {
        collection_id: CollectionId,
        doc_id: DocumentId,
        vector: Vec<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },

    /// Tombstone for a vector document
    Delete {
        collection_id: CollectionId,
        doc_id: DocumentId,
        timestamp: DateTime<Utc>,
    },
}

impl LogEntry {
    /// Builds the upsert record for `doc` owned by `collection_id`.
    pub fn upsert(collection_id: CollectionId, doc: &VectorDocument) -> Self {
        LogEntry::Upsert {
            collection_id,
            doc_id: doc.doc_id,
            vector: doc.vector.clone(),
            external_id: doc.external_id.clone(),
            metadata: doc.metadata.clone(),
            timestamp: doc.inserted_at,
        }
    }

    /// Builds a tombstone for `doc_id`.
    pub fn delete(collection_id: CollectionId, doc_id: DocumentId) -> Self {
        LogEntry::Delete {
            collection_id,
            doc_id,
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogEntry::Upsert { timestamp, .. } | LogEntry::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        match self {
            LogEntry::Upsert { collection_id, .. } | LogEntry::Delete { collection_id, .. } => {
                *collection_id
            }
        }
    }

    pub fn doc_id(&self) -> DocumentId {
        match self {
            LogEntry::Upsert { doc_id, .. } | LogEntry::Delete { doc_id, .. } => *doc_id,
        }
    }

    /// Converts the entry into the state it leaves behind: the document for
    /// an upsert, `None` for a tombstone.
    pub fn into_document(self) -> Option<VectorDocument> {
        match self {
            LogEntry::Upsert {
                doc_id,
                vector,
                external_id,
                metadata,
                timestamp,
                ..
            } => Some(VectorDocument {
                doc_id,
                external_id,
                vector,
                metadata,
                inserted_at: timestamp,
            }),
            LogEntry::Delete { .. } => None,
        }
    }
}

/// One on-disk WAL segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalSegment {
    /// Smallest LSN the segment can contain (taken from the file name)
    pub start_lsn: LogSequenceNumber,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Write-Ahead Log trait - ensures durability before acknowledging operations
///
/// Implementations must guarantee:
/// 1. Durability: data is fsync'd before `append()` returns
/// 2. Ordering: LSNs are strictly monotonically increasing and the on-disk
///    order matches LSN order
/// 3. Recoverability: `replay()` returns every retained entry >= `from_lsn`
#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Appends a single entry and returns its LSN.
    ///
    /// # Errors
    /// - `CoreError::ValidationError` if the entry belongs to another collection
    /// - `CoreError::IoError` if the disk write fails
    async fn append(&self, entry: LogEntry) -> CoreResult<LogSequenceNumber>;

    /// Appends entries under consecutive LSNs.
    async fn append_batch(&self, entries: Vec<LogEntry>) -> CoreResult<Vec<LogSequenceNumber>>;

    /// Returns all retained entries with LSN >= `from_lsn`, in LSN order.
    async fn replay(
        &self,
        from_lsn: LogSequenceNumber,
    ) -> CoreResult<Vec<(LogSequenceNumber, LogEntry)>>;

    /// Closes the active segment and starts a new one named after the next
    /// LSN to be assigned.
    async fn rotate(&self) -> CoreResult<()>;

    /// Deletes closed segments whose entries are all <= `lsn`. Returns the
    /// number of bytes reclaimed.
    async fn truncate_through(&self, lsn: LogSequenceNumber) -> CoreResult<u64>;

    /// Highest LSN assigned so far.
    async fn current_lsn(&self) -> CoreResult<LogSequenceNumber>;

    /// Total bytes across all retained segments.
    fn size_bytes(&self) -> u64;

    /// Flushes buffered writes and fsyncs the active segment.
    async fn flush(&self) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering() {
        let lsn1 = LogSequenceNumber::new(1);
        let lsn2 = LogSequenceNumber::new(2);

        assert!(lsn1 < lsn2);
        assert_eq!(lsn1.next().unwrap(), lsn2);
        assert_eq!(LogSequenceNumber::ZERO.next().unwrap().value(), 1);
    }

    #[test]
    fn test_lsn_overflow_is_an_error() {
        assert!(LogSequenceNumber::new(u64::MAX).next().is_err());
    }

    #[test]
    fn test_upsert_entry_roundtrips_document() {
        let collection_id = CollectionId::allocate();
        let doc = VectorDocument::new(DocumentId::new(), vec![1.0, 2.0])
            .with_external_id("ext-1")
            .with_metadata(serde_json::json!({"k": "v"}));

        let entry = LogEntry::upsert(collection_id, &doc);
        assert_eq!(entry.collection_id(), collection_id);
        assert_eq!(entry.doc_id(), doc.doc_id);

        let json = serde_json::to_string(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.into_document(), Some(doc));
    }

    #[test]
    fn test_delete_entry_is_tombstone() {
        let entry = LogEntry::delete(CollectionId::allocate(), DocumentId::new());
        assert!(entry.into_document().is_none());
    }
}
