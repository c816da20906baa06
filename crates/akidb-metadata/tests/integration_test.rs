use std::path::PathBuf;
use std::sync::Arc;

use akidb_core::{CollectionId, SnapshotId, Tier, TierStateRepository};
use akidb_metadata::{create_sqlite_pool, run_migrations, SqliteTierStateRepository};
use chrono::{Duration, Utc};

fn temp_db_path() -> PathBuf {
    let filename = format!("akidb-metadata-test-{}.db", CollectionId::allocate());
    std::env::temp_dir().join(filename)
}

async fn open_repository(db_path: &PathBuf) -> SqliteTierStateRepository {
    let database_url = format!("sqlite://{}", db_path.display());
    let pool = create_sqlite_pool(&database_url)
        .await
        .expect("failed to create pool");
    run_migrations(&pool).await.expect("failed migrations");
    SqliteTierStateRepository::new(pool)
}

#[tokio::test]
async fn tier_state_survives_reopening_the_database() {
    let db_path = temp_db_path();
    let collection_id = CollectionId::allocate();
    let snapshot_id = SnapshotId::new();

    {
        let repository = open_repository(&db_path).await;
        repository.init_tier_state(collection_id).await.unwrap();
        repository
            .update_tier_state(collection_id, Tier::Cold, None, Some(snapshot_id))
            .await
            .unwrap();
        repository.pin(collection_id).await.unwrap();
    }

    // Migrations are idempotent on an existing database.
    let repository = open_repository(&db_path).await;
    let state = repository
        .get_tier_state(collection_id)
        .await
        .unwrap()
        .expect("tier state persisted");
    assert_eq!(state.tier, Tier::Cold);
    assert_eq!(state.snapshot_id, Some(snapshot_id));
    assert!(state.pinned);
    assert_eq!(state.warm_file_path, None);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn concurrent_access_flushes_are_all_counted() {
    let db_path = temp_db_path();
    let repository = Arc::new(open_repository(&db_path).await);
    let collection_id = CollectionId::allocate();
    let state = repository.init_tier_state(collection_id).await.unwrap();
    let cutoff = state.access_window_start - Duration::hours(1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repository = repository.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                repository
                    .update_access_time(collection_id, Utc::now(), 3, cutoff)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let state = repository.get_tier_state(collection_id).await.unwrap().unwrap();
    assert_eq!(state.access_count, 8 * 5 * 3);

    let busy = repository
        .find_high_access_candidates(Tier::Hot, cutoff, 100, 10)
        .await
        .unwrap();
    assert_eq!(busy, vec![collection_id]);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn tier_counts_follow_transitions_and_deletes() {
    let db_path = temp_db_path();
    let repository = open_repository(&db_path).await;

    let ids: Vec<_> = (0..5).map(|_| CollectionId::allocate()).collect();
    for id in &ids {
        repository.init_tier_state(*id).await.unwrap();
    }
    repository
        .update_tier_state(ids[0], Tier::Warm, Some("/data/warm.json".into()), Some(SnapshotId::new()))
        .await
        .unwrap();
    repository
        .update_tier_state(ids[1], Tier::Cold, None, Some(SnapshotId::new()))
        .await
        .unwrap();

    assert_eq!(repository.count_in_tier(Tier::Hot).await.unwrap(), 3);
    assert_eq!(repository.count_in_tier(Tier::Warm).await.unwrap(), 1);
    assert_eq!(repository.count_in_tier(Tier::Cold).await.unwrap(), 1);

    repository.delete_tier_state(ids[1]).await.unwrap();
    assert_eq!(repository.count_in_tier(Tier::Cold).await.unwrap(), 0);
    assert!(repository.get_tier_state(ids[1]).await.unwrap().is_none());

    let _ = std::fs::remove_file(&db_path);
}
