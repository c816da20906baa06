use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::ids::{CollectionId, DocumentId, SnapshotId};
use crate::tier::{Tier, TierState};
use crate::vector::{SearchResult, VectorDocument};

/// Vector index trait for insert, search, and delete operations.
///
/// The index algorithm is opaque to the storage engine; it only relies on
/// insert, delete and clear to keep the index aligned with durable storage.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts a vector document into the index.
    async fn insert(&self, doc: VectorDocument) -> CoreResult<()>;

    /// Inserts multiple documents in a batch.
    ///
    /// Default implementation calls `insert` for each document sequentially.
    async fn insert_batch(&self, docs: Vec<VectorDocument>) -> CoreResult<()> {
        for doc in docs {
            self.insert(doc).await?;
        }
        Ok(())
    }

    /// Searches for k nearest neighbors.
    async fn search(&self, query: &[f32], k: usize) -> CoreResult<Vec<SearchResult>>;

    /// Deletes a document by ID.
    async fn delete(&self, doc_id: DocumentId) -> CoreResult<()>;

    /// Returns the total number of documents in the index.
    async fn count(&self) -> CoreResult<usize>;

    /// Clears the entire index.
    async fn clear(&self) -> CoreResult<()>;
}

/// Persistence of per-collection tier bookkeeping.
///
/// Candidate queries never return pinned collections from `find_idle_candidates`
/// and are ordered so the best candidates come first.
#[async_trait]
pub trait TierStateRepository: Send + Sync {
    /// Creates the row for a new collection in the Hot tier. Idempotent: an
    /// existing row is returned unchanged.
    async fn init_tier_state(&self, collection_id: CollectionId) -> CoreResult<TierState>;

    /// Loads the row for a collection.
    async fn get_tier_state(&self, collection_id: CollectionId) -> CoreResult<Option<TierState>>;

    /// Folds `accesses` accesses observed up to `accessed_at` into the row.
    ///
    /// If the stored access window started before `window_cutoff` the window
    /// restarts at `accessed_at` with a count of `accesses`.
    async fn update_access_time(
        &self,
        collection_id: CollectionId,
        accessed_at: DateTime<Utc>,
        accesses: u32,
        window_cutoff: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Restarts the access window at `at` with a zero count.
    async fn reset_access_window(
        &self,
        collection_id: CollectionId,
        at: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Records a completed tier transition.
    async fn update_tier_state(
        &self,
        collection_id: CollectionId,
        tier: Tier,
        warm_file_path: Option<String>,
        snapshot_id: Option<SnapshotId>,
    ) -> CoreResult<()>;

    /// Excludes the collection from automatic demotion.
    async fn pin(&self, collection_id: CollectionId) -> CoreResult<()>;

    /// Makes the collection eligible for automatic demotion again.
    async fn unpin(&self, collection_id: CollectionId) -> CoreResult<()>;

    /// Unpinned collections in `tier` not accessed since `idle_since`,
    /// least recently accessed first.
    async fn find_idle_candidates(
        &self,
        tier: Tier,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<CollectionId>>;

    /// Collections in `tier` whose access window started at or after
    /// `window_start` and that saw at least `min_access_count` accesses,
    /// most accessed first.
    async fn find_high_access_candidates(
        &self,
        tier: Tier,
        window_start: DateTime<Utc>,
        min_access_count: u32,
        limit: usize,
    ) -> CoreResult<Vec<CollectionId>>;

    /// Number of collections currently in `tier`.
    async fn count_in_tier(&self, tier: Tier) -> CoreResult<usize>;

    /// Removes the row of a deleted collection.
    async fn delete_tier_state(&self, collection_id: CollectionId) -> CoreResult<()>;
}
