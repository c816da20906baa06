//! Object Store abstraction for the cold tier
//!
//! Backends:
//! - AWS S3 and S3-compatible endpoints (MinIO)
//! - Local filesystem (warm snapshots, tests, single-box deployments)
//! - In-memory mock with failure injection (tests)
//!
//! Every key written by the engine is namespaced by the owning collection:
//! `<collection_id>/documents/<document_id>` for the document mirror and
//! `<collection_id>/snapshots/<snapshot_id>...` for snapshots.

mod local;
mod mock;
mod s3;
mod timeout;

pub use local::LocalObjectStore;
pub use mock::{CallHistoryEntry, MockFailure, MockS3Config, MockS3ObjectStore};
pub use s3::{S3Config, S3ObjectStore};
pub use timeout::TimeoutObjectStore;

use akidb_core::{CollectionId, CoreResult, DocumentId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Object metadata returned by list/head operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    /// ETag (None for local storage)
    pub etag: Option<String>,
}

/// Object Store trait - S3-like interface for cloud/local storage
///
/// Error semantics:
/// - `CoreError::NotFound` - object does not exist (`get`, `head`)
/// - `CoreError::ObjectStore` - remote failure, with the HTTP status when a
///   response arrived
/// - `CoreError::StorageError` / `CoreError::IoError` - local filesystem failure
/// - `CoreError::Timeout` - a call exceeded its deadline
/// - `CoreError::ValidationError` - malformed key
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `data` at `key`, overwriting any existing object.
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()>;

    async fn get(&self, key: &str) -> CoreResult<Bytes>;

    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Deletes the object. Deleting a missing object is a no-op.
    async fn delete(&self, key: &str) -> CoreResult<()>;

    /// Metadata of every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>>;

    async fn head(&self, key: &str) -> CoreResult<ObjectMetadata>;
}

/// Key of the mirrored copy of a document.
pub fn document_key(collection_id: CollectionId, doc_id: DocumentId) -> String {
    format!("{collection_id}/documents/{doc_id}")
}

/// Prefix of every object owned by a collection.
pub fn collection_prefix(collection_id: CollectionId) -> String {
    format!("{collection_id}/")
}

/// Which backend holds the cold tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Directory on the local filesystem
    Local { path: PathBuf },
    /// S3 or an S3-compatible endpoint
    S3(S3Config),
}

impl ObjectStoreConfig {
    /// Builds the store and wraps it so each call is bounded by `call_timeout`.
    pub async fn build(&self, call_timeout: Duration) -> CoreResult<Arc<dyn ObjectStore>> {
        let inner: Arc<dyn ObjectStore> = match self {
            ObjectStoreConfig::Local { path } => Arc::new(LocalObjectStore::new(path).await?),
            ObjectStoreConfig::S3(config) => Arc::new(S3ObjectStore::new(config.clone()).await?),
        };
        Ok(Arc::new(TimeoutObjectStore::new(inner, call_timeout)))
    }
}
