//! Compaction: snapshot the Hot document set, truncate the WAL behind it
//! and purge tombstones.

use super::{Placement, Shared};
use crate::snapshotter::Snapshotter;
use crate::wal::{LogSequenceNumber, WriteAheadLog};
use akidb_core::{CoreResult, SnapshotId};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of a compaction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    Compacted {
        snapshot_id: SnapshotId,
        wal_lsn: LogSequenceNumber,
        bytes_reclaimed: u64,
    },
    /// Nothing was written since the last compaction, or the collection is
    /// not Hot.
    Skipped,
}

impl Shared {
    pub(super) async fn compact(&self) -> CoreResult<CompactionOutcome> {
        let _transition = self.transition_lock.lock().await;

        if !matches!(*self.placement.read(), Placement::Hot) {
            return Ok(CompactionOutcome::Skipped);
        }
        let ops_before = self.ops_since_compaction.load(Ordering::Acquire);
        if ops_before == 0 {
            return Ok(CompactionOutcome::Skipped);
        }

        let started = std::time::Instant::now();
        // Writes after the capture stay counted for the next round.
        let (documents, wal_lsn, captured) = self.materialize().await?;
        let live = documents.len();

        let snapshot = self
            .local_snapshots
            .create_snapshot(self.collection_id, wal_lsn, documents)
            .await?;

        self.wal.rotate().await?;
        let bytes_reclaimed = self.wal.truncate_through(wal_lsn).await?;
        self.ops_since_compaction.fetch_sub(captured, Ordering::AcqRel);

        // While Hot the map is the full set, so a missing key reads the same
        // as a tombstone.
        let purged = {
            let mut docs = self.docs.write();
            let before = docs.len();
            docs.retain(|_, entry| entry.is_some());
            before - docs.len()
        };

        self.apply_snapshot_retention().await;
        let pruned = self.pipeline.prune_completed();

        {
            let mut metrics = self.metrics.write();
            metrics.compactions += 1;
            metrics.last_snapshot_at = Some(Utc::now());
        }

        tracing::info!(
            collection_id = %self.collection_id,
            snapshot_id = %snapshot.snapshot_id,
            lsn = %wal_lsn,
            documents = live,
            tombstones_purged = purged,
            bytes_reclaimed,
            upload_states_pruned = pruned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compaction complete"
        );

        Ok(CompactionOutcome::Compacted {
            snapshot_id: snapshot.snapshot_id,
            wal_lsn,
            bytes_reclaimed,
        })
    }

    /// Deletes local baselines beyond `snapshot_retention`, newest kept.
    async fn apply_snapshot_retention(&self) {
        let retention = self.config.compaction.snapshot_retention;
        let snapshots = match self.local_snapshots.list_snapshots(self.collection_id).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(collection_id = %self.collection_id, error = %e, "Failed to list snapshots for retention");
                return;
            }
        };

        for old in snapshots.into_iter().skip(retention) {
            if let Err(e) = self
                .local_snapshots
                .delete_snapshot(self.collection_id, old.snapshot_id)
                .await
            {
                tracing::warn!(
                    collection_id = %self.collection_id,
                    snapshot_id = %old.snapshot_id,
                    error = %e,
                    "Failed to delete expired snapshot"
                );
            }
        }
    }
}

/// Compacts when notified by a write that crossed a threshold, or on the
/// fallback interval. Exits when `cancel` fires.
pub(super) async fn run_compaction_worker(shared: Arc<Shared>, cancel: CancellationToken) {
    let interval = shared.config.compaction.check_interval();
    tracing::debug!(collection_id = %shared.collection_id, "Compaction worker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.compaction_notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        if !shared.should_compact() {
            continue;
        }

        match shared.compact().await {
            Ok(CompactionOutcome::Compacted { .. }) => {}
            Ok(CompactionOutcome::Skipped) => {
                tracing::debug!(collection_id = %shared.collection_id, "Compaction skipped");
            }
            Err(e) => {
                tracing::error!(collection_id = %shared.collection_id, error = %e, "Background compaction failed");
            }
        }
    }

    tracing::debug!(collection_id = %shared.collection_id, "Compaction worker stopped");
}
