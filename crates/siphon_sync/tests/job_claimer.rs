//! Claiming, building and acknowledging jobs.

mod support;

use chrono::{Duration, Utc};
use siphon_db::{JobState, JobType, SiphonDb};
use siphon_sync::work_item::{work_hash, DELETE_CONTENT_TYPE, UPSERT_CONTENT_TYPE};
use siphon_sync::{
    keys, ClaimConfig, ContentProvider, ItemOutcome, JobClaimer, SinkError, SyncEngine, WorkAction,
};
use std::collections::HashSet;
use std::sync::Arc;
use support::*;
use tempfile::TempDir;

fn claimer(db: &SiphonDb, provider: Arc<MemoryProvider>) -> JobClaimer {
    JobClaimer::new(db.clone(), ClaimConfig::default()).with_provider(provider)
}

#[tokio::test]
async fn test_run_once_delivers_and_acks() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(7, "2024-01-01 10:00:00", Some("abc"));
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    let sink = RecordingSink::default();
    let report = claimer(&db, provider.clone()).run_once(&sink, 5).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.acked, 1);

    let items = sink.delivered();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.action, WorkAction::Upsert);
    assert_eq!(item.content_type, UPSERT_CONTENT_TYPE);
    assert_eq!(item.collection_key, "lms");
    assert_eq!(
        item.hash,
        work_hash("lms", &provider.content_id(7), Some("2024-01-01 10:00:00"), Some("abc"))
    );
    assert_eq!(item.metadata.read_roles, vec![2, 4]);
    assert_eq!(
        item.metadata.direct_link.as_deref(),
        Some("goto.php/wiki/wpage_7_110")
    );
    assert_eq!(item.metadata.title.as_deref(), Some("Page 7"));
    let content = item.content.as_ref().unwrap();
    assert!(content.to_string().contains("page 7 at 2024-01-01 10:00:00"));
    assert!(item.size > 0);

    assert_eq!(count(&db, JobType::Upsert, JobState::Done).await, 1);
}

#[tokio::test]
async fn test_delete_waits_for_running_upsert() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(7, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    let claimer = claimer(&db, provider.clone());
    let upsert = claimer.claim(5).await.unwrap();
    assert_eq!(upsert.len(), 1);

    provider.remove(7);
    assert_eq!(engine.run(true).await.unwrap().deleted, 1);

    // The running upsert is not superseded and the delete is held back.
    let cid = provider.content_id(7);
    let history = db.jobs_for_content(&cid).await.unwrap();
    assert_eq!(history[0].state, JobState::Running);
    assert!(claimer.claim(5).await.unwrap().is_empty());

    assert!(claimer.ack(upsert[0].job_id).await.unwrap());
    let delete = claimer.claim(5).await.unwrap();
    assert_eq!(delete.len(), 1);
    assert_eq!(delete[0].job_type, JobType::Delete);

    let item = match claimer.build_work_item(&delete[0]).await {
        ItemOutcome::Ready(item) => item,
        other => panic!("expected item, got {other:?}"),
    };
    assert!(item.is_delete());
    assert_eq!(item.content_type, DELETE_CONTENT_TYPE);
    assert_eq!(item.content, None);

    assert!(claimer.ack(delete[0].job_id).await.unwrap());
    let seen = db.get_seen(&cid).await.unwrap().unwrap();
    assert!(seen.deleted_at.is_some());

    // Acks are idempotent.
    assert!(!claimer.ack(delete[0].job_id).await.unwrap());
}

async fn rescan_from_start(db: &SiphonDb, provider: &MemoryProvider) {
    db.delete_state(&keys::provider_cursor(provider.name(), SYSTEM, KIND))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unit_back_before_delete_delivery_stays_indexed() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(7, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();
    let claimer = claimer(&db, provider.clone());
    let sink = RecordingSink::default();
    claimer.run_once(&sink, 5).await.unwrap();

    provider.remove(7);
    assert_eq!(engine.run(true).await.unwrap().deleted, 1);

    // Back at the version the pipeline already holds, before the delete ran.
    provider.put(7, "2024-01-01 10:00:00", None);
    rescan_from_start(&db, &provider).await;
    let report = engine.run(true).await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.suppressed, 0);
    assert_eq!(report.errors, 0);

    assert_eq!(count(&db, JobType::Delete, JobState::Superseded).await, 1);
    assert_eq!(claimer.run_once(&sink, 5).await.unwrap().claimed, 0);
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].action, WorkAction::Upsert);

    let seen = db.get_seen(&provider.content_id(7)).await.unwrap().unwrap();
    assert!(seen.is_live());
    assert_eq!(seen.deleted_at, None);
}

#[tokio::test]
async fn test_unit_back_after_delete_delivery_is_reported() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(7, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();
    let claimer = claimer(&db, provider.clone());
    let sink = RecordingSink::default();
    claimer.run_once(&sink, 5).await.unwrap();

    provider.remove(7);
    engine.run(true).await.unwrap();
    claimer.run_once(&sink, 5).await.unwrap();
    assert_eq!(sink.delivered().last().map(|i| i.action), Some(WorkAction::Delete));

    // Same version again: no job can carry it, and the ledger must not claim it is indexed.
    provider.put(7, "2024-01-01 10:00:00", None);
    rescan_from_start(&db, &provider).await;
    let report = engine.run(true).await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.suppressed, 1);
    assert_eq!(report.errors, 1);
    assert!(report.to_string().contains("suppressed:1"));

    let seen = db.get_seen(&provider.content_id(7)).await.unwrap().unwrap();
    assert!(!seen.is_live());
    assert!(seen.deleted_at.is_some());
    assert!(jobs(&db, Some(JobState::Pending)).await.is_empty());

    // Still reported on the next full scan.
    rescan_from_start(&db, &provider).await;
    assert_eq!(engine.run(true).await.unwrap().suppressed, 1);
}

#[tokio::test]
async fn test_sink_failures_follow_retry_policy() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(1, "2024-01-01 10:00:00", None);
    provider.put(2, "2024-01-01 10:01:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();
    let claimer = claimer(&db, provider.clone());

    let flaky = RecordingSink::refusing(SinkError::retryable("timeout"));
    let report = claimer.run_once(&flaky, 1).await.unwrap();
    assert_eq!(report.failed, 1);
    let first = &jobs(&db, None).await[0];
    assert_eq!(first.state, JobState::Pending);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.error_message.as_deref(), Some("timeout"));

    let broken = RecordingSink::refusing(SinkError::permanent("rejected"));
    claimer.run_once(&broken, 5).await.unwrap();
    assert_eq!(count(&db, JobType::Upsert, JobState::Error).await, 2);
}

#[tokio::test]
async fn test_unbuildable_jobs_are_failed_not_left_leased() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(1, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    // No provider for the kind: skipped and retried later.
    let bare = JobClaimer::new(db.clone(), ClaimConfig::default());
    assert!(bare.extract(5).await.unwrap().is_empty());
    let job = &jobs(&db, None).await[0];
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);

    // Provider query failure: retryable error.
    provider.fail_content(true);
    let claimer = claimer(&db, provider.clone());
    assert!(claimer.extract(5).await.unwrap().is_empty());
    let job = &jobs(&db, None).await[0];
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 2);

    // Content gone at the source: skipped.
    provider.fail_content(false);
    provider.remove(1);
    assert!(claimer.extract(5).await.unwrap().is_empty());
    assert_eq!(jobs(&db, None).await[0].attempts, 3);
}

#[tokio::test]
async fn test_error_message_is_truncated() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(1, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    let config = ClaimConfig {
        max_error_len: 10,
        ..ClaimConfig::default()
    };
    let claimer = JobClaimer::new(db.clone(), config).with_provider(provider.clone());
    let job = claimer.claim(1).await.unwrap().remove(0);
    let next = claimer.fail(job.job_id, &"é".repeat(50), false).await.unwrap();
    assert_eq!(next, Some(JobState::Error));

    let stored = db.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.error_message.unwrap().chars().count(), 10);

    // Failing a job that is no longer running changes nothing.
    assert_eq!(claimer.fail(job.job_id, "late", true).await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    provider.put(1, "2024-01-01 10:00:00", None);
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    let start = Utc::now();
    let lease = Duration::seconds(60);
    let first = db.claim_jobs(1, lease, start).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(db.claim_jobs(1, lease, start + Duration::seconds(30)).await.unwrap().is_empty());

    let later = start + Duration::seconds(61);
    let released = db.release_expired_leases(later, 5).await.unwrap();
    assert_eq!(released.requeued, 1);

    let second = db.claim_jobs(1, lease, later).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].job_id, first[0].job_id);
    assert_eq!(second[0].attempts, 2);
    assert_ne!(second[0].claim_token, first[0].claim_token);
}

#[tokio::test]
async fn test_drain_empties_queue() {
    let provider = Arc::new(MemoryProvider::new(KIND));
    for id in 1..=7 {
        provider.put(id, "2024-01-01 10:00:00", None);
    }
    let (db, engine) = engine_with(provider.clone()).await;
    engine.run(true).await.unwrap();

    let sink = RecordingSink::default();
    let report = claimer(&db, provider.clone()).drain(&sink, 3).await.unwrap();
    assert_eq!(report.claimed, 7);
    assert_eq!(report.acked, 7);
    assert_eq!(sink.delivered().len(), 7);

    let stats = db.queue_stats().await.unwrap();
    assert_eq!(stats.counts.done, 7);
    assert_eq!(stats.counts.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_never_share_a_job() {
    let temp = TempDir::new().unwrap();
    let db = SiphonDb::open(temp.path().join("siphon.db")).await.unwrap();

    let provider = Arc::new(MemoryProvider::new(KIND));
    for id in 1..=40 {
        provider.put(id, "2024-01-01 10:00:00", None);
    }
    let engine = SyncEngine::new(db.clone(), sync_config()).with_provider(provider.clone());
    assert_eq!(engine.run(true).await.unwrap().changed, 40);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let claimer = claimer(&db, provider.clone());
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let jobs = claimer.claim(3).await.unwrap();
                if jobs.is_empty() {
                    break;
                }
                mine.extend(jobs.into_iter().map(|j| j.job_id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(total, 40);
    assert_eq!(count(&db, JobType::Upsert, JobState::Running).await, 40);
}
