use akidb_core::{
    CollectionId, CoreError, CoreResult, SnapshotId, Tier, TierState, TierStateRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{query, Row, SqlitePool};
use std::str::FromStr;

const SELECT_COLUMNS: &str = r#"
    SELECT
        collection_id, tier, last_accessed_at, access_count,
        access_window_start, pinned, snapshot_id, warm_file_path,
        created_at, updated_at
    FROM collection_tier_state
"#;

/// SQLite-backed [`TierStateRepository`].
///
/// Collection and snapshot ids are stored as 16-byte blobs; timestamps as
/// RFC 3339 strings with millisecond precision so that lexical comparison in
/// SQL matches chronological order.
pub struct SqliteTierStateRepository {
    pool: SqlitePool,
}

impl SqliteTierStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db_err(err: sqlx::Error) -> CoreError {
    CoreError::internal(err.to_string())
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_ts(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CoreError::internal(format!("invalid timestamp `{raw}`: {e}")))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn row_to_state(row: &SqliteRow) -> CoreResult<TierState> {
    let collection_id_bytes: Vec<u8> = row.try_get("collection_id").map_err(db_err)?;
    let tier: String = row.try_get("tier").map_err(db_err)?;
    let snapshot_id_bytes: Option<Vec<u8>> = row.try_get("snapshot_id").map_err(db_err)?;
    let last_accessed_at: String = row.try_get("last_accessed_at").map_err(db_err)?;
    let access_window_start: String = row.try_get("access_window_start").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
    let access_count: i64 = row.try_get("access_count").map_err(db_err)?;
    let pinned: i64 = row.try_get("pinned").map_err(db_err)?;

    let snapshot_id = snapshot_id_bytes
        .map(|bytes| SnapshotId::from_bytes(&bytes))
        .transpose()
        .map_err(|e| CoreError::internal(e.to_string()))?;

    Ok(TierState {
        collection_id: CollectionId::from_bytes(&collection_id_bytes)
            .map_err(|e| CoreError::internal(e.to_string()))?,
        tier: Tier::from_str(&tier)?,
        last_accessed_at: decode_ts(&last_accessed_at)?,
        access_count: u32::try_from(access_count).unwrap_or(u32::MAX),
        access_window_start: decode_ts(&access_window_start)?,
        pinned: pinned != 0,
        snapshot_id,
        warm_file_path: row.try_get("warm_file_path").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
    })
}

fn rows_to_ids(rows: Vec<SqliteRow>) -> CoreResult<Vec<CollectionId>> {
    rows.into_iter()
        .map(|row| {
            let bytes: Vec<u8> = row.try_get("collection_id").map_err(db_err)?;
            CollectionId::from_bytes(&bytes).map_err(|e| CoreError::internal(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl TierStateRepository for SqliteTierStateRepository {
    async fn init_tier_state(&self, collection_id: CollectionId) -> CoreResult<TierState> {
        let now = encode_ts(Utc::now());

        query(
            r#"
            INSERT INTO collection_tier_state (
                collection_id, tier, last_accessed_at, access_count,
                access_window_start, pinned, created_at, updated_at
            ) VALUES (?1, 'hot', ?2, 0, ?2, 0, ?2, ?2)
            ON CONFLICT(collection_id) DO NOTHING
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_tier_state(collection_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("tier state for {collection_id} vanished")))
    }

    async fn get_tier_state(&self, collection_id: CollectionId) -> CoreResult<Option<TierState>> {
        let row = query(&format!("{SELECT_COLUMNS} WHERE collection_id = ?1"))
            .bind(collection_id.to_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_state).transpose()
    }

    async fn update_access_time(
        &self,
        collection_id: CollectionId,
        accessed_at: DateTime<Utc>,
        accesses: u32,
        window_cutoff: DateTime<Utc>,
    ) -> CoreResult<()> {
        let accessed_at = encode_ts(accessed_at);

        query(
            r#"
            UPDATE collection_tier_state
            SET access_count = CASE
                    WHEN access_window_start < ?4 THEN ?3
                    ELSE access_count + ?3
                END,
                access_window_start = CASE
                    WHEN access_window_start < ?4 THEN ?2
                    ELSE access_window_start
                END,
                last_accessed_at = MAX(last_accessed_at, ?2),
                updated_at = ?5
            WHERE collection_id = ?1
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(accessed_at)
        .bind(i64::from(accesses))
        .bind(encode_ts(window_cutoff))
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn reset_access_window(
        &self,
        collection_id: CollectionId,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let at = encode_ts(at);

        query(
            r#"
            UPDATE collection_tier_state
            SET access_count = 0,
                access_window_start = ?2,
                updated_at = ?2
            WHERE collection_id = ?1
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_tier_state(
        &self,
        collection_id: CollectionId,
        tier: Tier,
        warm_file_path: Option<String>,
        snapshot_id: Option<SnapshotId>,
    ) -> CoreResult<()> {
        let result = query(
            r#"
            UPDATE collection_tier_state
            SET tier = ?2,
                warm_file_path = ?3,
                snapshot_id = ?4,
                updated_at = ?5
            WHERE collection_id = ?1
            "#,
        )
        .bind(collection_id.to_bytes().to_vec())
        .bind(tier.as_str())
        .bind(warm_file_path)
        .bind(snapshot_id.map(|id| id.to_bytes().to_vec()))
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("tier state", collection_id.to_string()));
        }
        Ok(())
    }

    async fn pin(&self, collection_id: CollectionId) -> CoreResult<()> {
        set_pinned(&self.pool, collection_id, true).await
    }

    async fn unpin(&self, collection_id: CollectionId) -> CoreResult<()> {
        set_pinned(&self.pool, collection_id, false).await
    }

    async fn find_idle_candidates(
        &self,
        tier: Tier,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<CollectionId>> {
        let rows = query(
            r#"
            SELECT collection_id
            FROM collection_tier_state
            WHERE tier = ?1
              AND last_accessed_at < ?2
              AND pinned = 0
            ORDER BY last_accessed_at ASC
            LIMIT ?3
            "#,
        )
        .bind(tier.as_str())
        .bind(encode_ts(idle_since))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows_to_ids(rows)
    }

    async fn find_high_access_candidates(
        &self,
        tier: Tier,
        window_start: DateTime<Utc>,
        min_access_count: u32,
        limit: usize,
    ) -> CoreResult<Vec<CollectionId>> {
        let rows = query(
            r#"
            SELECT collection_id
            FROM collection_tier_state
            WHERE tier = ?1
              AND access_window_start >= ?2
              AND access_count >= ?3
            ORDER BY access_count DESC, last_accessed_at DESC
            LIMIT ?4
            "#,
        )
        .bind(tier.as_str())
        .bind(encode_ts(window_start))
        .bind(i64::from(min_access_count))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows_to_ids(rows)
    }

    async fn count_in_tier(&self, tier: Tier) -> CoreResult<usize> {
        let row = query("SELECT COUNT(*) AS total FROM collection_tier_state WHERE tier = ?1")
            .bind(tier.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let total: i64 = row.try_get("total").map_err(db_err)?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    async fn delete_tier_state(&self, collection_id: CollectionId) -> CoreResult<()> {
        query("DELETE FROM collection_tier_state WHERE collection_id = ?1")
            .bind(collection_id.to_bytes().to_vec())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

async fn set_pinned(pool: &SqlitePool, collection_id: CollectionId, pinned: bool) -> CoreResult<()> {
    let result = query(
        r#"
        UPDATE collection_tier_state
        SET pinned = ?2,
            updated_at = ?3
        WHERE collection_id = ?1
        "#,
    )
    .bind(collection_id.to_bytes().to_vec())
    .bind(i64::from(pinned))
    .bind(encode_ts(Utc::now()))
    .execute(pool)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("tier state", collection_id.to_string()));
    }
    tracing::debug!(collection_id = %collection_id, pinned, "Updated pin flag");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_in_memory_pool;
    use chrono::Duration;

    async fn repository() -> SqliteTierStateRepository {
        let pool = create_in_memory_pool().await.unwrap();
        SqliteTierStateRepository::new(pool)
    }

    #[tokio::test]
    async fn init_is_idempotent_and_starts_hot() {
        let repo = repository().await;
        let id = CollectionId::allocate();

        let first = repo.init_tier_state(id).await.unwrap();
        repo.pin(id).await.unwrap();
        let second = repo.init_tier_state(id).await.unwrap();

        assert_eq!(first.tier, Tier::Hot);
        assert_eq!(first.access_count, 0);
        assert!(second.pinned, "re-init must not reset an existing row");
    }

    #[tokio::test]
    async fn missing_state_is_none() {
        let repo = repository().await;
        assert!(repo
            .get_tier_state(CollectionId::allocate())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_tier_state_stores_snapshot_and_path() {
        let repo = repository().await;
        let id = CollectionId::allocate();
        repo.init_tier_state(id).await.unwrap();

        let snapshot_id = SnapshotId::new();
        repo.update_tier_state(id, Tier::Warm, Some("/data/warm.json".into()), Some(snapshot_id))
            .await
            .unwrap();

        let state = repo.get_tier_state(id).await.unwrap().unwrap();
        assert_eq!(state.tier, Tier::Warm);
        assert_eq!(state.snapshot_id, Some(snapshot_id));
        assert_eq!(state.warm_file_path.as_deref(), Some("/data/warm.json"));
    }

    #[tokio::test]
    async fn update_tier_state_for_unknown_collection_fails() {
        let repo = repository().await;
        let err = repo
            .update_tier_state(CollectionId::allocate(), Tier::Cold, None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn access_window_accumulates_then_restarts() {
        let repo = repository().await;
        let id = CollectionId::allocate();
        let state = repo.init_tier_state(id).await.unwrap();

        let now = Utc::now();
        let cutoff = state.access_window_start - Duration::seconds(1);
        repo.update_access_time(id, now, 3, cutoff).await.unwrap();
        repo.update_access_time(id, now, 2, cutoff).await.unwrap();
        let accumulated = repo.get_tier_state(id).await.unwrap().unwrap();
        assert_eq!(accumulated.access_count, 5);

        let later = now + Duration::seconds(10);
        repo.update_access_time(id, later, 1, later - Duration::seconds(1))
            .await
            .unwrap();
        let restarted = repo.get_tier_state(id).await.unwrap().unwrap();
        assert_eq!(restarted.access_count, 1);
        assert_eq!(encode_ts(restarted.access_window_start), encode_ts(later));
        assert_eq!(encode_ts(restarted.last_accessed_at), encode_ts(later));
    }

    #[tokio::test]
    async fn pinned_collections_are_never_idle_candidates() {
        let repo = repository().await;
        let pinned = CollectionId::allocate();
        let free = CollectionId::allocate();
        repo.init_tier_state(pinned).await.unwrap();
        repo.init_tier_state(free).await.unwrap();
        repo.pin(pinned).await.unwrap();

        let far_future = Utc::now() + Duration::days(365);
        let candidates = repo
            .find_idle_candidates(Tier::Hot, far_future, 10)
            .await
            .unwrap();
        assert_eq!(candidates, vec![free]);

        repo.unpin(pinned).await.unwrap();
        let candidates = repo
            .find_idle_candidates(Tier::Hot, far_future, 10)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.contains(&pinned));
    }

    #[tokio::test]
    async fn idle_candidates_are_oldest_first_and_limited() {
        let repo = repository().await;
        let ids: Vec<_> = (0..3).map(|_| CollectionId::allocate()).collect();
        let base = Utc::now() - Duration::hours(5);
        for (offset, id) in ids.iter().enumerate() {
            repo.init_tier_state(*id).await.unwrap();
            let at = base + Duration::minutes(offset as i64);
            repo.update_access_time(*id, at, 1, at).await.unwrap();
        }
        let candidates = repo
            .find_idle_candidates(Tier::Hot, Utc::now() + Duration::hours(1), 2)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn high_access_candidates_respect_tier_threshold_and_window() {
        let repo = repository().await;
        let busy = CollectionId::allocate();
        let quiet = CollectionId::allocate();
        for id in [busy, quiet] {
            repo.init_tier_state(id).await.unwrap();
            repo.update_tier_state(id, Tier::Warm, Some("w".into()), Some(SnapshotId::new()))
                .await
                .unwrap();
        }
        let window_start = Utc::now() - Duration::minutes(5);
        repo.update_access_time(busy, Utc::now(), 12, window_start)
            .await
            .unwrap();
        repo.update_access_time(quiet, Utc::now(), 2, window_start)
            .await
            .unwrap();

        let candidates = repo
            .find_high_access_candidates(Tier::Warm, window_start, 10, 10)
            .await
            .unwrap();
        assert_eq!(candidates, vec![busy]);

        let none_hot = repo
            .find_high_access_candidates(Tier::Hot, window_start, 1, 10)
            .await
            .unwrap();
        assert!(none_hot.is_empty());
    }

    #[tokio::test]
    async fn count_and_delete() {
        let repo = repository().await;
        let id = CollectionId::allocate();
        repo.init_tier_state(id).await.unwrap();
        assert_eq!(repo.count_in_tier(Tier::Hot).await.unwrap(), 1);

        repo.delete_tier_state(id).await.unwrap();
        assert_eq!(repo.count_in_tier(Tier::Hot).await.unwrap(), 0);
        assert!(repo.get_tier_state(id).await.unwrap().is_none());
    }
}
