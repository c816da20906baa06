//! Full collection snapshots
//!
//! A snapshot is every live document of a collection at a given WAL LSN,
//! serialized as JSON and optionally gzip-compressed. It is written as two
//! objects; the metadata sidecar goes last and acts as the commit marker, so
//! a crash mid-write leaves an orphaned data object that is never listed.
//!
//! ```text
//! <collection_id>/snapshots/<snapshot_id>.json[.gz]   documents
//! <collection_id>/snapshots/<snapshot_id>.meta.json   SnapshotMetadata
//! ```
//!
//! Snapshots serve as compaction baselines and warm-tier files (local store)
//! and as cold-tier objects (S3).

use crate::object_store::ObjectStore;
use crate::wal::LogSequenceNumber;
use akidb_core::{CollectionId, CoreError, CoreResult, SnapshotId, VectorDocument};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

/// Compression codec for snapshot data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    None,
    #[default]
    Gzip,
}

impl CompressionCodec {
    fn extension(self) -> &'static str {
        match self {
            CompressionCodec::None => "json",
            CompressionCodec::Gzip => "json.gz",
        }
    }
}

impl std::fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionCodec::None => write!(f, "none"),
            CompressionCodec::Gzip => write!(f, "gzip"),
        }
    }
}

/// Snapshot metadata sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: SnapshotId,
    pub collection_id: CollectionId,
    /// Highest WAL LSN reflected in the snapshot
    pub wal_lsn: LogSequenceNumber,
    pub document_count: u64,
    /// Vector dimension, `None` for an empty snapshot
    pub dimension: Option<u32>,
    /// Size of the data object in bytes (after compression)
    pub size_bytes: u64,
    pub compression: CompressionCodec,
    pub created_at: DateTime<Utc>,
}

/// Key of a snapshot's data object.
pub fn data_key(
    collection_id: CollectionId,
    snapshot_id: SnapshotId,
    compression: CompressionCodec,
) -> String {
    format!(
        "{collection_id}/snapshots/{snapshot_id}.{}",
        compression.extension()
    )
}

/// Key of a snapshot's metadata sidecar.
pub fn metadata_key(collection_id: CollectionId, snapshot_id: SnapshotId) -> String {
    format!("{collection_id}/snapshots/{snapshot_id}.meta.json")
}

/// Snapshotter trait - serialize a collection's documents to an object store
///
/// Implementations must guarantee:
/// 1. Atomicity: a snapshot is visible only once its metadata exists
/// 2. Consistency: restored documents equal the snapshotted documents
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Writes a snapshot of `documents` taken at `wal_lsn`. Empty snapshots
    /// are allowed.
    async fn create_snapshot(
        &self,
        collection_id: CollectionId,
        wal_lsn: LogSequenceNumber,
        documents: Vec<VectorDocument>,
    ) -> CoreResult<SnapshotMetadata>;

    /// Reads back the documents of a snapshot.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the snapshot doesn't exist
    /// - `CoreError::DeserializationError` if the snapshot is corrupted
    async fn restore_snapshot(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<Vec<VectorDocument>>;

    async fn get_metadata(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<SnapshotMetadata>;

    /// Committed snapshots of a collection, highest `wal_lsn` first.
    async fn list_snapshots(&self, collection_id: CollectionId)
        -> CoreResult<Vec<SnapshotMetadata>>;

    /// Deletes a snapshot. Idempotent.
    async fn delete_snapshot(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<()>;

    /// Newest committed snapshot of a collection.
    async fn latest_snapshot(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<Option<SnapshotMetadata>> {
        Ok(self.list_snapshots(collection_id).await?.into_iter().next())
    }
}

/// JSON snapshotter with optional gzip compression
pub struct JsonSnapshotter {
    object_store: Arc<dyn ObjectStore>,
    compression: CompressionCodec,
}

impl JsonSnapshotter {
    pub fn new(object_store: Arc<dyn ObjectStore>, compression: CompressionCodec) -> Self {
        Self {
            object_store,
            compression,
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    fn compress(&self, data: Vec<u8>) -> CoreResult<Vec<u8>> {
        match self.compression {
            CompressionCodec::None => Ok(data),
            CompressionCodec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                encoder.write_all(&data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    fn decompress(codec: CompressionCodec, data: &[u8]) -> CoreResult<Vec<u8>> {
        match codec {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data).read_to_end(&mut out).map_err(|e| {
                    CoreError::DeserializationError(format!("corrupt gzip snapshot: {e}"))
                })?;
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl Snapshotter for JsonSnapshotter {
    async fn create_snapshot(
        &self,
        collection_id: CollectionId,
        wal_lsn: LogSequenceNumber,
        documents: Vec<VectorDocument>,
    ) -> CoreResult<SnapshotMetadata> {
        let snapshot_id = SnapshotId::new();
        let dimension = documents.first().map(|d| d.vector.len() as u32);

        let encoded = serde_json::to_vec(&documents)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        let data = self.compress(encoded)?;
        let size_bytes = data.len() as u64;

        self.object_store
            .put(
                &data_key(collection_id, snapshot_id, self.compression),
                Bytes::from(data),
            )
            .await?;

        let metadata = SnapshotMetadata {
            snapshot_id,
            collection_id,
            wal_lsn,
            document_count: documents.len() as u64,
            dimension,
            size_bytes,
            compression: self.compression,
            created_at: Utc::now(),
        };

        let sidecar = serde_json::to_vec(&metadata)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        self.object_store
            .put(&metadata_key(collection_id, snapshot_id), Bytes::from(sidecar))
            .await?;

        tracing::debug!(
            collection_id = %collection_id,
            snapshot_id = %snapshot_id,
            lsn = %wal_lsn,
            documents = metadata.document_count,
            bytes = size_bytes,
            "Snapshot written"
        );
        Ok(metadata)
    }

    async fn restore_snapshot(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<Vec<VectorDocument>> {
        let metadata = self.get_metadata(collection_id, snapshot_id).await?;
        let raw = self
            .object_store
            .get(&data_key(collection_id, snapshot_id, metadata.compression))
            .await?;

        let json = Self::decompress(metadata.compression, &raw)?;
        let documents: Vec<VectorDocument> = serde_json::from_slice(&json)?;

        if documents.len() as u64 != metadata.document_count {
            return Err(CoreError::DeserializationError(format!(
                "snapshot {snapshot_id} holds {} documents, metadata says {}",
                documents.len(),
                metadata.document_count
            )));
        }
        Ok(documents)
    }

    async fn get_metadata(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<SnapshotMetadata> {
        let data = self
            .object_store
            .get(&metadata_key(collection_id, snapshot_id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    CoreError::not_found("snapshot", snapshot_id.to_string())
                } else {
                    e
                }
            })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn list_snapshots(
        &self,
        collection_id: CollectionId,
    ) -> CoreResult<Vec<SnapshotMetadata>> {
        let prefix = format!("{collection_id}/snapshots/");
        let mut snapshots = Vec::new();

        for object in self.object_store.list(&prefix).await? {
            if !object.key.ends_with(".meta.json") {
                continue;
            }
            let data = match self.object_store.get(&object.key).await {
                Ok(data) => data,
                // Deleted concurrently
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<SnapshotMetadata>(&data) {
                Ok(metadata) if metadata.collection_id == collection_id => snapshots.push(metadata),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %object.key, error = %e, "Ignoring unreadable snapshot metadata");
                }
            }
        }

        snapshots.sort_by(|a, b| {
            b.wal_lsn
                .cmp(&a.wal_lsn)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(snapshots)
    }

    async fn delete_snapshot(
        &self,
        collection_id: CollectionId,
        snapshot_id: SnapshotId,
    ) -> CoreResult<()> {
        // Sidecar first so a partial delete never exposes a snapshot without data.
        self.object_store
            .delete(&metadata_key(collection_id, snapshot_id))
            .await?;
        for codec in [CompressionCodec::None, CompressionCodec::Gzip] {
            self.object_store
                .delete(&data_key(collection_id, snapshot_id, codec))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{LocalObjectStore, MockS3ObjectStore};
    use akidb_core::DocumentId;
    use tempfile::TempDir;

    fn documents(count: usize, dimension: usize) -> Vec<VectorDocument> {
        (0..count)
            .map(|i| {
                VectorDocument::new(DocumentId::new(), vec![i as f32; dimension])
                    .with_external_id(format!("doc-{i}"))
                    .with_metadata(serde_json::json!({"index": i}))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_restore_gzip_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(temp_dir.path()).await.unwrap());
        let snapshotter = JsonSnapshotter::new(store, CompressionCodec::Gzip);
        let cid = CollectionId::allocate();
        let docs = documents(50, 16);

        let meta = snapshotter
            .create_snapshot(cid, LogSequenceNumber::new(50), docs.clone())
            .await
            .unwrap();
        assert_eq!(meta.collection_id, cid);
        assert_eq!(meta.document_count, 50);
        assert_eq!(meta.dimension, Some(16));

        let restored = snapshotter.restore_snapshot(cid, meta.snapshot_id).await.unwrap();
        assert_eq!(restored, docs);
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_allowed() {
        let snapshotter = JsonSnapshotter::new(Arc::new(MockS3ObjectStore::new()), CompressionCodec::None);
        let cid = CollectionId::allocate();

        let meta = snapshotter
            .create_snapshot(cid, LogSequenceNumber::ZERO, Vec::new())
            .await
            .unwrap();
        assert_eq!(meta.dimension, None);
        assert!(snapshotter
            .restore_snapshot(cid, meta.snapshot_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_keys_carry_collection_id() {
        let store = Arc::new(MockS3ObjectStore::new());
        let snapshotter = JsonSnapshotter::new(store.clone(), CompressionCodec::Gzip);
        let cid = CollectionId::allocate();

        snapshotter
            .create_snapshot(cid, LogSequenceNumber::new(3), documents(3, 4))
            .await
            .unwrap();

        let keys = store.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with(&format!("{cid}/snapshots/"))));
    }

    #[tokio::test]
    async fn test_latest_snapshot_orders_by_lsn() {
        let store = Arc::new(MockS3ObjectStore::new());
        let snapshotter = JsonSnapshotter::new(store, CompressionCodec::None);
        let cid = CollectionId::allocate();
        let other = CollectionId::allocate();

        snapshotter
            .create_snapshot(cid, LogSequenceNumber::new(20), documents(1, 2))
            .await
            .unwrap();
        let newest = snapshotter
            .create_snapshot(cid, LogSequenceNumber::new(40), documents(2, 2))
            .await
            .unwrap();
        snapshotter
            .create_snapshot(other, LogSequenceNumber::new(99), documents(1, 2))
            .await
            .unwrap();

        let latest = snapshotter.latest_snapshot(cid).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, newest.snapshot_id);
        assert_eq!(snapshotter.list_snapshots(cid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_snapshot_is_idempotent() {
        let store = Arc::new(MockS3ObjectStore::new());
        let snapshotter = JsonSnapshotter::new(store.clone(), CompressionCodec::Gzip);
        let cid = CollectionId::allocate();

        let meta = snapshotter
            .create_snapshot(cid, LogSequenceNumber::new(1), documents(1, 2))
            .await
            .unwrap();
        snapshotter.delete_snapshot(cid, meta.snapshot_id).await.unwrap();
        snapshotter.delete_snapshot(cid, meta.snapshot_id).await.unwrap();

        assert_eq!(store.storage_size(), 0);
        let err = snapshotter
            .restore_snapshot(cid, meta.snapshot_id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_orphaned_data_without_metadata_is_invisible() {
        let store = Arc::new(MockS3ObjectStore::new());
        let snapshotter = JsonSnapshotter::new(store.clone(), CompressionCodec::None);
        let cid = CollectionId::allocate();

        store
            .put(
                &data_key(cid, SnapshotId::new(), CompressionCodec::None),
                Bytes::from("[]"),
            )
            .await
            .unwrap();

        assert!(snapshotter.latest_snapshot(cid).await.unwrap().is_none());
    }
}
