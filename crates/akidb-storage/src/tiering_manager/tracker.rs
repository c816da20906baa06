use akidb_core::{CollectionId, Tier};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Access statistics for a collection
#[derive(Debug, Clone)]
pub struct AccessStats {
    /// Tier the collection was last seen in
    pub tier: Tier,
    /// Timestamp of most recent access
    pub last_accessed_at: DateTime<Utc>,
    /// Number of accesses in current time window
    pub access_count: u32,
    /// Start time of current measurement window
    pub window_start: DateTime<Utc>,
    /// Accesses not yet flushed to the tier state repository
    pub pending: u32,
}

/// Accesses recorded since the previous flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAccess {
    pub collection_id: CollectionId,
    pub last_accessed_at: DateTime<Utc>,
    pub count: u32,
}

/// In-memory access tracker
///
/// Tracks collection access patterns to inform tiering decisions.
/// - Records access timestamps
/// - Maintains access counts within time windows
/// - Buffers counts until the tiering worker flushes them
///
/// History is lost on restart; the persisted `TierState` is the source of
/// truth across restarts.
#[derive(Debug, Default)]
pub struct AccessTracker {
    stats: RwLock<HashMap<CollectionId, AccessStats>>,
}

impl AccessTracker {
    /// Create new access tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a collection, seeded from its persisted state.
    pub fn track(&self, collection_id: CollectionId, tier: Tier, last_accessed_at: DateTime<Utc>) {
        self.stats
            .write()
            .entry(collection_id)
            .and_modify(|stats| stats.tier = tier)
            .or_insert_with(|| AccessStats {
                tier,
                last_accessed_at,
                access_count: 0,
                window_start: Utc::now(),
                pending: 0,
            });
    }

    pub fn untrack(&self, collection_id: CollectionId) {
        self.stats.write().remove(&collection_id);
    }

    /// Record a collection access
    ///
    /// Called on every read and write. Untracked collections are ignored.
    pub fn record_access(&self, collection_id: CollectionId) {
        let now = Utc::now();
        if let Some(stats) = self.stats.write().get_mut(&collection_id) {
            stats.last_accessed_at = now;
            stats.access_count = stats.access_count.saturating_add(1);
            stats.pending = stats.pending.saturating_add(1);
        }
    }

    /// Get access stats for a collection
    pub fn get_stats(&self, collection_id: CollectionId) -> Option<AccessStats> {
        self.stats.read().get(&collection_id).cloned()
    }

    pub fn set_tier(&self, collection_id: CollectionId, tier: Tier) {
        if let Some(stats) = self.stats.write().get_mut(&collection_id) {
            stats.tier = tier;
        }
    }

    /// Reset access window (after a transition)
    pub fn reset_window(&self, collection_id: CollectionId) {
        if let Some(stats) = self.stats.write().get_mut(&collection_id) {
            stats.access_count = 0;
            stats.window_start = Utc::now();
        }
    }

    /// Takes every unflushed access count, leaving zero behind.
    pub fn drain_pending(&self) -> Vec<PendingAccess> {
        let mut stats = self.stats.write();
        stats
            .iter_mut()
            .filter(|(_, s)| s.pending > 0)
            .map(|(collection_id, s)| PendingAccess {
                collection_id: *collection_id,
                last_accessed_at: s.last_accessed_at,
                count: std::mem::take(&mut s.pending),
            })
            .collect()
    }

    /// Puts counts back after a failed flush.
    pub fn restore_pending(&self, pending: PendingAccess) {
        if let Some(stats) = self.stats.write().get_mut(&pending.collection_id) {
            stats.pending = stats.pending.saturating_add(pending.count);
        }
    }

    /// Least recently used collections in `tier`, oldest access first.
    pub fn lru_candidates(&self, tier: Tier, batch_size: usize) -> Vec<CollectionId> {
        let stats = self.stats.read();
        let mut candidates: Vec<(DateTime<Utc>, CollectionId)> = stats
            .iter()
            .filter(|(_, s)| s.tier == tier)
            .map(|(id, s)| (s.last_accessed_at, *id))
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .take(batch_size)
            .map(|(_, id)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stats.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracked(tracker: &AccessTracker, tier: Tier) -> CollectionId {
        let collection_id = CollectionId::allocate();
        tracker.track(collection_id, tier, Utc::now());
        collection_id
    }

    #[test]
    fn test_record_access() {
        let tracker = AccessTracker::new();
        let collection_id = tracked(&tracker, Tier::Hot);

        tracker.record_access(collection_id);

        let stats = tracker.get_stats(collection_id).unwrap();
        assert_eq!(stats.access_count, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_untracked_collection_is_ignored() {
        let tracker = AccessTracker::new();
        let collection_id = CollectionId::allocate();

        tracker.record_access(collection_id);
        assert!(tracker.get_stats(collection_id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reset_window() {
        let tracker = AccessTracker::new();
        let collection_id = tracked(&tracker, Tier::Warm);

        for _ in 0..5 {
            tracker.record_access(collection_id);
        }
        assert_eq!(tracker.get_stats(collection_id).unwrap().access_count, 5);

        tracker.reset_window(collection_id);
        assert_eq!(tracker.get_stats(collection_id).unwrap().access_count, 0);
    }

    #[test]
    fn test_drain_pending_takes_counts_once() {
        let tracker = AccessTracker::new();
        let busy = tracked(&tracker, Tier::Hot);
        let _idle = tracked(&tracker, Tier::Hot);

        for _ in 0..3 {
            tracker.record_access(busy);
        }

        let pending = tracker.drain_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].collection_id, busy);
        assert_eq!(pending[0].count, 3);
        assert!(tracker.drain_pending().is_empty());

        tracker.restore_pending(pending[0]);
        assert_eq!(tracker.drain_pending()[0].count, 3);
    }

    #[test]
    fn test_lru_candidates_sorted_oldest_first() {
        let tracker = AccessTracker::new();
        let now = Utc::now();

        let newest = CollectionId::allocate();
        let oldest = CollectionId::allocate();
        let middle = CollectionId::allocate();
        let warm = CollectionId::allocate();
        tracker.track(newest, Tier::Hot, now);
        tracker.track(oldest, Tier::Hot, now - chrono::Duration::hours(2));
        tracker.track(middle, Tier::Hot, now - chrono::Duration::hours(1));
        tracker.track(warm, Tier::Warm, now - chrono::Duration::days(1));

        assert_eq!(tracker.lru_candidates(Tier::Hot, 10), vec![oldest, middle, newest]);
        assert_eq!(tracker.lru_candidates(Tier::Hot, 2), vec![oldest, middle]);
        assert_eq!(tracker.lru_candidates(Tier::Warm, 10), vec![warm]);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let tracker = Arc::new(AccessTracker::new());
        let collection_id = tracked(&tracker, Tier::Hot);

        let mut handles = vec![];
        for _ in 0..100 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker.record_access(collection_id);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = tracker.get_stats(collection_id).unwrap();
        assert_eq!(stats.access_count, 100);
    }
}
