//! Queue invariants: exclusive claims, idempotent enqueue, lease reclaim,
//! ordering, cancellation, and build debouncing.

mod common;

use common::setup_pool;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use sv_common::models::JobStatus;
use sv_common::time::{now_iso, now_plus_seconds_iso};
use sv_worker::queue::{self, job_types, EnqueueOptions};

#[tokio::test]
async fn claims_are_exclusive_under_concurrency() {
    let pool = setup_pool().await;
    let total = 20;
    for i in 0..total {
        queue::enqueue_job(
            &pool,
            job_types::INGEST_SOURCE,
            Some(json!({ "source_id": format!("s{i}") })),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    }

    let claimed = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for w in 0..8 {
        let pool = pool.clone();
        let claimed = Arc::clone(&claimed);
        workers.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            loop {
                match queue::claim_next_job(&pool, &worker_id, &[job_types::INGEST_SOURCE], 60)
                    .await
                {
                    Ok(Some(job)) => {
                        claimed.lock().await.push(job.id.clone());
                        queue::complete_job(&pool, &job.id, None).await.unwrap();
                    }
                    Ok(None) => break,
                    Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let claimed = claimed.lock().await;
    assert_eq!(claimed.len(), total, "every job claimed exactly once");
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(unique.len(), total, "no job claimed twice");
}

#[tokio::test]
async fn idempotency_key_permits_one_active_job() {
    let pool = setup_pool().await;
    let options = || EnqueueOptions {
        idempotency_key: Some("events_rebuild".to_string()),
        ..Default::default()
    };
    let first = queue::enqueue_job(&pool, job_types::EVENTS_REBUILD, None, options())
        .await
        .unwrap();
    let second = queue::enqueue_job(&pool, job_types::EVENTS_REBUILD, None, options())
        .await
        .unwrap();
    assert_eq!(first, second, "duplicate enqueue returns the active job");

    // Still one active job while the first is running.
    let job = queue::claim_next_job(&pool, "w1", &[job_types::EVENTS_REBUILD], 60)
        .await
        .unwrap()
        .unwrap();
    let third = queue::enqueue_job(&pool, job_types::EVENTS_REBUILD, None, options())
        .await
        .unwrap();
    assert_eq!(third, job.id);

    // After completion a fresh one may be enqueued.
    queue::complete_job(&pool, &job.id, None).await.unwrap();
    let fourth = queue::enqueue_job(&pool, job_types::EVENTS_REBUILD, None, options())
        .await
        .unwrap();
    assert_ne!(fourth, first);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_with_attempt_count() {
    let pool = setup_pool().await;
    let job_id = queue::enqueue_job(
        &pool,
        job_types::INGEST_SOURCE,
        Some(json!({ "source_id": "s1" })),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    // Worker 1 claims with a 1-second lease and dies without renewing.
    let claimed = queue::claim_next_job(&pool, "w1", &[job_types::INGEST_SOURCE], 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.attempts, 1);

    // Before expiry nobody else can take it.
    assert!(queue::claim_next_job(&pool, "w2", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let reclaimed = queue::claim_next_job(&pool, "w2", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .expect("stale lease must be reclaimable");
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));

    assert!(queue::complete_job(&pool, &job_id, None).await.unwrap());
    let done = queue::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn claims_follow_priority_then_fifo() {
    let pool = setup_pool().await;
    let low_early = queue::enqueue_job(
        &pool,
        job_types::BUILD_SITE,
        Some(json!({ "n": 1 })),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let low_late = queue::enqueue_job(
        &pool,
        job_types::BUILD_SITE,
        Some(json!({ "n": 2 })),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    let high = queue::enqueue_job(
        &pool,
        job_types::BUILD_SITE,
        Some(json!({ "n": 3 })),
        EnqueueOptions {
            priority: 10,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue::claim_next_job(&pool, "w", &[job_types::BUILD_SITE], 60)
        .await
        .unwrap()
    {
        order.push(job.id.clone());
        queue::complete_job(&pool, &job.id, None).await.unwrap();
    }
    assert_eq!(order, vec![high, low_early, low_late]);
}

#[tokio::test]
async fn run_after_defers_claims() {
    let pool = setup_pool().await;
    queue::enqueue_job(
        &pool,
        job_types::BUILD_SITE,
        None,
        EnqueueOptions {
            run_after: Some(now_plus_seconds_iso(3600)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(queue::claim_next_job(&pool, "w", &[job_types::BUILD_SITE], 60)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn cancel_all_flips_queued_and_signals_running() {
    let pool = setup_pool().await;
    for i in 0..5 {
        queue::enqueue_job(
            &pool,
            job_types::INGEST_SOURCE,
            Some(json!({ "source_id": format!("s{i}") })),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    }
    // Claim two of them so they are running.
    let running_a = queue::claim_next_job(&pool, "w1", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .unwrap();
    let running_b = queue::claim_next_job(&pool, "w2", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .unwrap();

    let (queued_canceled, running_signaled) = queue::cancel_all_jobs(&pool).await.unwrap();
    assert_eq!(queued_canceled, 3);
    assert_eq!(running_signaled, 2);

    for job_id in [&running_a.id, &running_b.id] {
        assert!(queue::is_cancel_requested(&pool, job_id).await.unwrap());
        // The owning worker observes the signal and settles the row.
        assert!(queue::mark_canceled(&pool, job_id).await.unwrap());
        let job = queue::get_job(&pool, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }
    // Nothing is claimable afterwards.
    assert!(queue::claim_next_job(&pool, "w3", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn canceled_queued_job_is_never_claimed() {
    let pool = setup_pool().await;
    let job_id = queue::enqueue_job(&pool, job_types::BUILD_SITE, None, EnqueueOptions::default())
        .await
        .unwrap();
    assert!(queue::cancel_job(&pool, &job_id).await.unwrap());
    assert!(queue::claim_next_job(&pool, "w", &[job_types::BUILD_SITE], 60)
        .await
        .unwrap()
        .is_none());
    let job = queue::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
}

#[tokio::test]
async fn build_enqueue_coalesces_within_debounce_window() {
    let pool = setup_pool().await;
    let first = queue::enqueue_build_site_if_needed(&pool, "writer-1", 30)
        .await
        .unwrap();
    assert!(first.is_some());
    for writer in ["writer-2", "writer-3", "writer-4"] {
        let again = queue::enqueue_build_site_if_needed(&pool, writer, 30)
            .await
            .unwrap();
        assert!(again.is_none(), "burst writers must coalesce");
    }
    assert_eq!(common::count_jobs_of_type(&pool, job_types::BUILD_SITE).await, 1);

    // The single job carries a run_after delay so it absorbs the burst.
    let job = queue::get_job(&pool, &first.unwrap()).await.unwrap().unwrap();
    assert!(job.run_after > now_iso());
}

#[tokio::test]
async fn requeue_backoff_defers_and_resets_lease() {
    let pool = setup_pool().await;
    queue::enqueue_job(&pool, job_types::INGEST_SOURCE, Some(json!({"source_id": "s1"})), EnqueueOptions::default())
        .await
        .unwrap();
    let job = queue::claim_next_job(&pool, "w1", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .unwrap();
    let run_after = queue::requeue_with_backoff(&pool, &job, 30, 3600, None)
        .await
        .unwrap();
    assert!(run_after > now_iso());

    let row = queue::get_job(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Queued);
    assert!(row.lease_owner.is_none());
    // Not claimable until the backoff elapses.
    assert!(queue::claim_next_job(&pool, "w2", &[job_types::INGEST_SOURCE], 60)
        .await
        .unwrap()
        .is_none());
}
