//! Enabling and disabling a kind end to end.

mod support;

use siphon_db::{JobState, JobType, SiphonDb};
use siphon_sync::{
    clear_kind_override, keys, set_kind_enabled, ContentProvider, KindTransition, SyncConfig,
    SyncEngine,
};
use std::sync::Arc;
use support::*;

async fn synced(units: i64) -> (Arc<MemoryProvider>, SiphonDb, SyncEngine) {
    let provider = Arc::new(MemoryProvider::new(KIND));
    for id in 1..=units {
        provider.put(id, &format!("2024-01-01 10:00:{id:02}"), None);
    }
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();
    (provider, db, engine)
}

#[tokio::test]
async fn test_first_observation_only_records_flag() {
    let (_provider, db, engine) = synced(2).await;

    assert_eq!(
        db.get_state(&keys::kind_enabled(KIND)).await.unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(
        engine.apply_kind_transition("blog_post").await.unwrap(),
        KindTransition::Initialized { enabled: false }
    );
    assert_eq!(
        engine.apply_kind_transition(KIND).await.unwrap(),
        KindTransition::Unchanged
    );
    assert_eq!(jobs(&db, None).await.len(), 2);
}

#[tokio::test]
async fn test_disable_then_enable_rebuilds_kind() {
    let (provider, db, engine) = synced(3).await;

    // Index the first three, leave a fourth pending.
    for job in jobs(&db, Some(JobState::Pending)).await {
        db.claim_jobs(1, chrono::Duration::seconds(60), chrono::Utc::now())
            .await
            .unwrap();
        db.ack_job(job.job_id).await.unwrap();
    }
    provider.put(4, "2024-01-02 08:00:00", None);
    engine.run(true).await.unwrap();
    assert_eq!(count(&db, JobType::Upsert, JobState::Done).await, 3);
    assert_eq!(count(&db, JobType::Upsert, JobState::Pending).await, 1);

    set_kind_enabled(&db, KIND, false).await.unwrap();
    let report = engine.run(false).await.unwrap();
    assert_eq!(report.toggles, 1);
    assert_eq!(report.providers, 0);

    assert_eq!(count(&db, JobType::Upsert, JobState::Superseded).await, 1);
    assert_eq!(count(&db, JobType::Delete, JobState::Pending).await, 4);
    assert_eq!(db.count_seen(Some(KIND)).await.unwrap(), 0);
    let cursor = keys::provider_cursor(provider.name(), SYSTEM, KIND);
    assert_eq!(db.get_state(&cursor).await.unwrap(), None);
    assert_eq!(db.get_state(&keys::bulk_delete_after(KIND)).await.unwrap(), None);
    assert_eq!(
        db.get_state(&keys::kind_enabled(KIND)).await.unwrap().as_deref(),
        Some("0")
    );

    // A second run while disabled does nothing.
    let idle = engine.run(true).await.unwrap();
    assert_eq!(idle.toggles, 0);
    assert_eq!(jobs(&db, None).await.len(), 8);

    set_kind_enabled(&db, KIND, true).await.unwrap();
    let report = engine.run(false).await.unwrap();
    assert_eq!(report.toggles, 1);
    assert_eq!(report.changed, 4);

    let all = jobs(&db, None).await;
    assert_eq!(all.len(), 4);
    assert!(all
        .iter()
        .all(|j| j.job_type == JobType::Upsert && j.state == JobState::Pending));
    assert_eq!(db.count_seen(Some(KIND)).await.unwrap(), 4);
}

#[tokio::test]
async fn test_disable_clears_cursors_of_unregistered_providers() {
    let (_provider, db, engine) = synced(1).await;
    let stale = keys::provider_cursor("old_wiki", SYSTEM, KIND);
    let other = keys::provider_cursor("blogs", SYSTEM, "blog_post");
    db.set_state(&stale, "2023-01-01 00:00:00|9").await.unwrap();
    db.set_state(&other, "2023-01-01 00:00:00|9").await.unwrap();

    set_kind_enabled(&db, KIND, false).await.unwrap();
    engine.run(true).await.unwrap();

    assert_eq!(db.get_state(&stale).await.unwrap(), None);
    assert!(db.get_state(&other).await.unwrap().is_some());
}

#[tokio::test]
async fn test_bulk_delete_resumes_after_stored_cursor() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    for id in 1..=5 {
        provider.put(id, "2024-01-01 10:00:00", None);
    }
    let db = SiphonDb::open_in_memory().await.unwrap();
    let config = SyncConfig {
        bulk_delete_batch: 2,
        ..sync_config()
    };
    let engine = SyncEngine::new(db.clone(), config).with_provider(provider.clone());
    engine.run(true).await.unwrap();

    let mut ids: Vec<_> = (1..=5).map(|id| provider.content_id(id)).collect();
    ids.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    // As if a previous teardown died after its first page.
    db.set_state(&keys::bulk_delete_after(KIND), &ids[1].to_hex())
        .await
        .unwrap();

    let created = engine.bulk_delete_kind(KIND).await.unwrap();
    assert_eq!(created, 3);

    for (i, cid) in ids.iter().enumerate() {
        let seen = db.get_seen(cid).await.unwrap().unwrap();
        assert_eq!(seen.missing_since.is_some(), i >= 2, "record {i}");
    }
    assert_eq!(
        db.get_state(&keys::bulk_delete_after(KIND)).await.unwrap(),
        Some(ids[4].to_hex())
    );

    // Nothing left past the cursor.
    assert_eq!(engine.bulk_delete_kind(KIND).await.unwrap(), 0);
}

#[tokio::test]
async fn test_toggle_flag_survives_restart() {
    let (provider, db, _engine) = synced(2).await;
    set_kind_enabled(&db, KIND, false).await.unwrap();

    // A fresh engine on the same store sees the pending transition.
    let engine = SyncEngine::new(db.clone(), sync_config()).with_provider(provider.clone());
    let transition = engine.apply_kind_transition(KIND).await.unwrap();
    assert_eq!(
        transition,
        KindTransition::Disabled {
            superseded: 2,
            delete_jobs: 2
        }
    );
}

#[tokio::test]
async fn test_clearing_override_restores_configured_default() {
    let (_provider, db, engine) = synced(1).await;
    assert!(!clear_kind_override(&db, KIND).await.unwrap());

    set_kind_enabled(&db, KIND, false).await.unwrap();
    assert!(!engine.is_kind_enabled(KIND).await.unwrap());
    db.set_state(keys::LAST_RUN_AT, "2024-01-01T00:00:00Z").await.unwrap();

    assert!(clear_kind_override(&db, KIND).await.unwrap());
    assert!(engine.is_kind_enabled(KIND).await.unwrap());
    assert_eq!(db.get_state(keys::LAST_RUN_AT).await.unwrap(), None);
}
