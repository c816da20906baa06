//! Two-phase tier transitions
//!
//! `prepare` writes the target tier's artifact while holding the
//! collection's transition lock. The caller then records the new tier in its
//! metadata store and either `commit`s (switch placement, drop superseded
//! artifacts) or `abort`s (delete the new artifact). Every artifact is a full
//! snapshot at the LSN captured during `prepare`; writes that land during the
//! transition are picked up from the WAL at commit.

use super::{Placement, Shared, StorageBackend};
use crate::snapshotter::{SnapshotMetadata, Snapshotter};
use crate::wal::LogSequenceNumber;
use akidb_core::{CoreError, CoreResult, DocumentId, SnapshotId, Tier, VectorDocument};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::OwnedMutexGuard;

/// One step between adjacent tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierTransition {
    /// Hot -> Warm: write a local snapshot, drop documents from memory
    DemoteToWarm,
    /// Warm -> Cold: write the snapshot to the cold store, delete local files
    DemoteToCold,
    /// Cold -> Warm: download the cold snapshot into a local one
    PromoteToWarm,
    /// Warm -> Hot: load the local snapshot into memory
    PromoteToHot,
}

impl TierTransition {
    pub fn between(from: Tier, to: Tier) -> Option<Self> {
        match (from, to) {
            (Tier::Hot, Tier::Warm) => Some(Self::DemoteToWarm),
            (Tier::Warm, Tier::Cold) => Some(Self::DemoteToCold),
            (Tier::Cold, Tier::Warm) => Some(Self::PromoteToWarm),
            (Tier::Warm, Tier::Hot) => Some(Self::PromoteToHot),
            _ => None,
        }
    }

    pub fn from_tier(&self) -> Tier {
        match self {
            Self::DemoteToWarm => Tier::Hot,
            Self::DemoteToCold | Self::PromoteToHot => Tier::Warm,
            Self::PromoteToWarm => Tier::Cold,
        }
    }

    pub fn to_tier(&self) -> Tier {
        match self {
            Self::DemoteToWarm | Self::PromoteToWarm => Tier::Warm,
            Self::DemoteToCold => Tier::Cold,
            Self::PromoteToHot => Tier::Hot,
        }
    }

    pub fn is_promotion(&self) -> bool {
        matches!(self, Self::PromoteToWarm | Self::PromoteToHot)
    }
}

impl fmt::Display for TierTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from_tier(), self.to_tier())
    }
}

/// Artifacts of a prepared transition. Holds the collection's transition
/// lock until committed, aborted or dropped.
pub struct PreparedTransition {
    transition: TierTransition,
    wal_lsn: LogSequenceNumber,
    /// Snapshot written for a Warm or Cold target
    snapshot: Option<SnapshotMetadata>,
    warm_file_path: Option<PathBuf>,
    /// Document set loaded for a Hot target
    loaded: Option<Vec<VectorDocument>>,
    _guard: OwnedMutexGuard<()>,
}

impl PreparedTransition {
    pub fn transition(&self) -> TierTransition {
        self.transition
    }

    /// Snapshot id to record for the target tier (`None` for Hot).
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.snapshot.as_ref().map(|s| s.snapshot_id)
    }

    /// Local snapshot path to record for a Warm target.
    pub fn warm_file_path(&self) -> Option<String> {
        self.warm_file_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    }

    pub fn wal_lsn(&self) -> LogSequenceNumber {
        self.wal_lsn
    }
}

impl fmt::Debug for PreparedTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTransition")
            .field("transition", &self.transition)
            .field("wal_lsn", &self.wal_lsn)
            .field("snapshot_id", &self.snapshot_id())
            .field("warm_file_path", &self.warm_file_path)
            .finish()
    }
}

impl Shared {
    fn snapshotter_for(&self, tier: Tier) -> &dyn Snapshotter {
        match tier {
            Tier::Cold => &self.cold_snapshots,
            Tier::Hot | Tier::Warm => &self.local_snapshots,
        }
    }
}

impl StorageBackend {
    /// Phase one: write the target tier's artifact.
    ///
    /// Blocks compaction and other transitions of this collection until the
    /// returned value is committed, aborted or dropped. Reads and writes keep
    /// going.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` if the backend is not Ready or the
    ///   collection is not in `transition.from_tier()`
    /// - the object-store error if the artifact cannot be written
    pub async fn prepare_transition(
        &self,
        transition: TierTransition,
    ) -> CoreResult<PreparedTransition> {
        let shared = &self.shared;
        shared.ensure_ready()?;
        let guard = shared.transition_lock.clone().lock_owned().await;

        let current = shared.tier();
        if current != transition.from_tier() {
            return Err(CoreError::invalid_state(format!(
                "cannot apply {transition} to collection {} in tier {current}",
                shared.collection_id
            )));
        }

        let (documents, wal_lsn, _ops) = shared.materialize().await?;

        let (snapshot, warm_file_path, loaded) = match transition.to_tier() {
            Tier::Hot => (None, None, Some(documents)),
            target => {
                let snapshot = shared
                    .snapshotter_for(target)
                    .create_snapshot(shared.collection_id, wal_lsn, documents)
                    .await?;
                let path = if target == Tier::Warm {
                    Some(shared.warm_path(&snapshot)?)
                } else {
                    None
                };
                (Some(snapshot), path, None)
            }
        };

        tracing::info!(
            collection_id = %shared.collection_id,
            transition = %transition,
            lsn = %wal_lsn,
            snapshot_id = ?snapshot.as_ref().map(|s| s.snapshot_id),
            "Tier transition prepared"
        );

        Ok(PreparedTransition {
            transition,
            wal_lsn,
            snapshot,
            warm_file_path,
            loaded,
            _guard: guard,
        })
    }

    /// Phase two: switch to the prepared placement.
    ///
    /// Superseded artifacts (the Warm snapshot after a demotion to Cold, the
    /// Cold snapshot after a promotion to Warm) are deleted on a best-effort
    /// basis once the switch succeeded.
    pub async fn commit_transition(&self, prepared: PreparedTransition) -> CoreResult<()> {
        let shared = &self.shared;
        let transition = prepared.transition;
        let previous = shared.placement.read().clone();

        let placement = match (transition.to_tier(), &prepared.snapshot) {
            (Tier::Hot, _) => Placement::Hot,
            (Tier::Warm, Some(snapshot)) => Placement::Warm {
                snapshot: snapshot.clone(),
                path: prepared.warm_file_path.clone().ok_or_else(|| {
                    CoreError::internal("prepared Warm transition has no local path")
                })?,
            },
            (Tier::Cold, Some(snapshot)) => Placement::Cold {
                snapshot: snapshot.clone(),
            },
            (tier, None) => {
                return Err(CoreError::internal(format!(
                    "prepared {tier} transition has no snapshot"
                )))
            }
        };

        {
            let _write = shared.write_lock.lock().await;
            // Writes that landed after the captured LSN.
            let (delta, replayed) = shared.replay_after(prepared.wal_lsn).await?;

            let docs: HashMap<DocumentId, Option<VectorDocument>> = match &prepared.loaded {
                Some(loaded) => {
                    let mut docs: HashMap<_, _> = loaded
                        .iter()
                        .map(|doc| (doc.doc_id, Some(doc.clone())))
                        .collect();
                    docs.extend(delta);
                    docs
                }
                None => delta,
            };

            *shared.docs.write() = docs;
            shared.set_placement(placement);
            tracing::debug!(
                collection_id = %shared.collection_id,
                replayed,
                "Applied writes made during transition"
            );
        }

        shared.metrics.write().tier_transitions += 1;

        let superseded = match (transition, &previous) {
            (TierTransition::DemoteToCold, Placement::Warm { snapshot, .. }) => {
                Some((Tier::Warm, snapshot.snapshot_id))
            }
            (TierTransition::PromoteToWarm, Placement::Cold { snapshot }) => {
                Some((Tier::Cold, snapshot.snapshot_id))
            }
            _ => None,
        };
        if let Some((tier, snapshot_id)) = superseded {
            if let Err(e) = shared
                .snapshotter_for(tier)
                .delete_snapshot(shared.collection_id, snapshot_id)
                .await
            {
                tracing::warn!(
                    collection_id = %shared.collection_id,
                    snapshot_id = %snapshot_id,
                    error = %e,
                    "Failed to delete superseded snapshot"
                );
            }
        }

        tracing::info!(
            collection_id = %shared.collection_id,
            transition = %transition,
            "Tier transition committed"
        );
        Ok(())
    }

    /// Deletes the artifact written by `prepare_transition`. The collection
    /// stays in its current tier.
    pub async fn abort_transition(&self, prepared: PreparedTransition) {
        let shared = &self.shared;
        if let Some(snapshot) = &prepared.snapshot {
            if let Err(e) = shared
                .snapshotter_for(prepared.transition.to_tier())
                .delete_snapshot(shared.collection_id, snapshot.snapshot_id)
                .await
            {
                tracing::warn!(
                    collection_id = %shared.collection_id,
                    snapshot_id = %snapshot.snapshot_id,
                    error = %e,
                    "Failed to delete artifact of aborted transition"
                );
            }
        }

        tracing::warn!(
            collection_id = %shared.collection_id,
            transition = %prepared.transition,
            "Tier transition aborted"
        );
    }

    /// Prepares and commits in one call, for callers without a metadata store.
    pub async fn transition_to(&self, transition: TierTransition) -> CoreResult<TransitionOutcome> {
        let prepared = self.prepare_transition(transition).await?;
        let outcome = TransitionOutcome {
            snapshot_id: prepared.snapshot_id(),
            warm_file_path: prepared.warm_file_path(),
        };
        self.commit_transition(prepared).await?;
        Ok(outcome)
    }
}

/// Tier metadata produced by a committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub snapshot_id: Option<SnapshotId>,
    pub warm_file_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MockS3ObjectStore;
    use crate::StorageConfig;
    use akidb_core::CollectionId;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (StorageBackend, Arc<MockS3ObjectStore>, Vec<VectorDocument>) {
        let cold = Arc::new(MockS3ObjectStore::new());
        let backend = StorageBackend::open(
            CollectionId::allocate(),
            StorageConfig::new(dir.path()).without_background_compaction(),
            cold.clone(),
            None,
        )
        .await
        .unwrap();

        let mut docs = Vec::new();
        for i in 0..10 {
            let doc = VectorDocument::new(DocumentId::new(), vec![i as f32, 1.0]);
            backend.insert(doc.clone()).await.unwrap();
            docs.push(doc);
        }
        (backend, cold, docs)
    }

    #[test]
    fn test_transition_between_adjacent_tiers_only() {
        assert_eq!(
            TierTransition::between(Tier::Hot, Tier::Warm),
            Some(TierTransition::DemoteToWarm)
        );
        assert_eq!(TierTransition::between(Tier::Hot, Tier::Cold), None);
        assert_eq!(TierTransition::between(Tier::Cold, Tier::Hot), None);
        assert_eq!(TierTransition::PromoteToHot.to_string(), "warm->hot");
    }

    #[tokio::test]
    async fn test_full_cycle_preserves_documents() {
        let dir = TempDir::new().unwrap();
        let (backend, _cold, docs) = setup(&dir).await;

        backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();
        assert_eq!(backend.tier(), Tier::Warm);
        assert!(backend.warm_file_path().unwrap().exists());
        assert_eq!(backend.hot_document_count(), 0);
        assert_eq!(backend.get(&docs[3].doc_id).await.unwrap(), Some(docs[3].clone()));

        backend.transition_to(TierTransition::DemoteToCold).await.unwrap();
        assert_eq!(backend.tier(), Tier::Cold);
        assert!(backend.warm_file_path().is_none());
        assert_eq!(backend.get(&docs[7].doc_id).await.unwrap(), Some(docs[7].clone()));

        backend.transition_to(TierTransition::PromoteToWarm).await.unwrap();
        backend.transition_to(TierTransition::PromoteToHot).await.unwrap();
        assert_eq!(backend.tier(), Tier::Hot);
        assert_eq!(backend.hot_document_count(), docs.len());
        assert_eq!(backend.metrics().tier_transitions, 4);
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_while_warm_are_visible_and_promoted() {
        let dir = TempDir::new().unwrap();
        let (backend, _cold, docs) = setup(&dir).await;
        backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();

        let added = VectorDocument::new(DocumentId::new(), vec![9.0, 9.0]);
        backend.insert(added.clone()).await.unwrap();
        backend.delete(&docs[0].doc_id).await.unwrap();

        assert_eq!(backend.get(&added.doc_id).await.unwrap(), Some(added.clone()));
        assert!(backend.get(&docs[0].doc_id).await.unwrap().is_none());

        backend.transition_to(TierTransition::PromoteToHot).await.unwrap();
        let all = backend.all_documents().await.unwrap();
        assert_eq!(all.len(), docs.len());
        assert!(all.iter().any(|d| d.doc_id == added.doc_id));
        assert!(all.iter().all(|d| d.doc_id != docs[0].doc_id));
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_source_tier_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (backend, _cold, _docs) = setup(&dir).await;

        let err = backend
            .prepare_transition(TierTransition::PromoteToHot)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_deletes_artifact_and_keeps_tier() {
        let dir = TempDir::new().unwrap();
        let (backend, cold, _docs) = setup(&dir).await;
        backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();

        let prepared = backend
            .prepare_transition(TierTransition::DemoteToCold)
            .await
            .unwrap();
        let snapshot_id = prepared.snapshot_id().unwrap();
        assert!(cold.keys().iter().any(|k| k.contains(&snapshot_id.to_string())));

        backend.abort_transition(prepared).await;
        assert_eq!(backend.tier(), Tier::Warm);
        assert!(!cold.keys().iter().any(|k| k.contains(&snapshot_id.to_string())));
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_waits_for_prepared_transition() {
        let dir = TempDir::new().unwrap();
        let (backend, _cold, _docs) = setup(&dir).await;
        let backend = Arc::new(backend);

        let prepared = backend
            .prepare_transition(TierTransition::DemoteToWarm)
            .await
            .unwrap();

        let compacting = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.compact().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!compacting.is_finished());

        backend.commit_transition(prepared).await.unwrap();
        // Warm collections are not compacted.
        assert_eq!(
            compacting.await.unwrap().unwrap(),
            crate::CompactionOutcome::Skipped
        );
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_warm_collection_from_tier_state() {
        let dir = TempDir::new().unwrap();
        let cold = Arc::new(MockS3ObjectStore::new());
        let config = StorageConfig::new(dir.path()).without_background_compaction();
        let cid = CollectionId::allocate();

        let doc = VectorDocument::new(DocumentId::new(), vec![1.0]);
        let late = VectorDocument::new(DocumentId::new(), vec![2.0]);
        let outcome = {
            let backend = StorageBackend::open(cid, config.clone(), cold.clone(), None)
                .await
                .unwrap();
            backend.insert(doc.clone()).await.unwrap();
            let outcome = backend.transition_to(TierTransition::DemoteToWarm).await.unwrap();
            backend.insert(late.clone()).await.unwrap();
            backend.shutdown().await.unwrap();
            outcome
        };

        let mut state = akidb_core::TierState::new(cid);
        state.tier = Tier::Warm;
        state.snapshot_id = outcome.snapshot_id;
        state.warm_file_path = outcome.warm_file_path;

        let backend = StorageBackend::open(cid, config, cold, Some(&state))
            .await
            .unwrap();
        assert_eq!(backend.tier(), Tier::Warm);
        assert_eq!(backend.get(&doc.doc_id).await.unwrap(), Some(doc));
        assert_eq!(backend.get(&late.doc_id).await.unwrap(), Some(late));
        backend.shutdown().await.unwrap();
    }
}
