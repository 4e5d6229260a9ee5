//! Shared test helpers: in-memory database, seeded sources, and job
//! contexts wired the way the worker pool wires them.
#![allow(dead_code)]

use serde_json::Value;
use sqlx::SqlitePool;
use sv_common::models::{Job, JobStatus, Source, SourceKind};
use sv_common::params::RuntimeConfig;
use sv_common::time::now_iso;
use sv_worker::worker::JobContext;
use tokio::sync::watch;

pub async fn setup_pool() -> SqlitePool {
    let pool = sv_common::db::init_memory_pool().await.unwrap();
    sv_common::db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn test_source(id: &str, url: &str) -> Source {
    Source {
        id: id.to_string(),
        name: format!("Test source {id}"),
        kind: SourceKind::Rss,
        url: url.to_string(),
        enabled: true,
        interval_minutes: 60,
        tags: vec![],
        pause_until: None,
        paused_reason: None,
        user_agent: None,
        http_headers: Default::default(),
        timeout_seconds: None,
        allow_keywords: vec![],
        deny_keywords: vec![],
        min_interval_seconds: None,
        html_item_selector: None,
        etag: None,
        last_modified: None,
        last_fetch_at: None,
    }
}

/// Build a JobContext around a synthetic claimed job, the way the worker
/// pool does before dispatch.
pub fn make_ctx(
    pool: &SqlitePool,
    config: RuntimeConfig,
    job_type: &str,
    payload: Value,
) -> (JobContext, watch::Sender<bool>) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let job = Job {
        id: format!("test-{job_type}"),
        job_type: job_type.to_string(),
        payload,
        status: JobStatus::Running,
        priority: 0,
        requested_at: now_iso(),
        run_after: now_iso(),
        started_at: Some(now_iso()),
        finished_at: None,
        attempts: 1,
        max_attempts: 5,
        lease_owner: Some("test-worker".to_string()),
        lease_expires_at: None,
        cancel_requested: false,
        idempotency_key: None,
        result: None,
        error: None,
    };
    (
        JobContext {
            pool: pool.clone(),
            config,
            job,
            cancel: cancel_rx,
        },
        cancel_tx,
    )
}

/// Serve a fixed body on an ephemeral local port; returns the URL.
pub async fn serve_fixture(body: &'static str, content_type: &'static str) -> String {
    use axum::response::IntoResponse;
    use axum::routing::get;

    let app = axum::Router::new().route(
        "/feed",
        get(move || async move {
            ([("content-type", content_type)], body).into_response()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/feed")
}

pub async fn count_jobs_of_type(pool: &SqlitePool, job_type: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE job_type = ?")
        .bind(job_type)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn insert_seed_article(pool: &SqlitePool, id: &str, source_id: &str, title: &str) {
    sqlx::query(
        "INSERT INTO articles (id, source_id, title, original_url, canonical_url, ingested_at, tags_json)
         VALUES (?, ?, ?, ?, ?, ?, '[]')",
    )
    .bind(id)
    .bind(source_id)
    .bind(title)
    .bind(format!("https://example.com/{id}"))
    .bind(format!("https://example.com/{id}"))
    .bind(now_iso())
    .execute(pool)
    .await
    .unwrap();
}

pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}
