//! Admin command layer
//!
//! The stable set of commands the administrative surface consumes. Each
//! command returns a typed result; errors carry a kind from the taxonomy
//! (validation, not_found, conflict, internal) plus a human-readable
//! message. HTTP/UI concerns live in the admin process, not here.

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use sv_common::models::{Job, JobStatus, Source};
use sv_common::params::{self, RuntimeConfig};
use sv_common::{Error, Result};

use crate::db::{articles, cves, events, health, llm, sources};
use crate::events as events_engine;
use crate::ingest;
use crate::queue::{self, job_types, EnqueueOptions};

/// Job types an operator may enqueue directly.
const ENQUEUEABLE_TYPES: &[&str] = &[
    job_types::INGEST_DUE_SOURCES,
    job_types::INGEST_SOURCE,
    job_types::FETCH_ARTICLE_CONTENT,
    job_types::SUMMARIZE_ARTICLE_LLM,
    job_types::WRITE_ARTICLE_MARKDOWN,
    job_types::CVE_SYNC,
    job_types::EVENTS_REBUILD,
    job_types::EVENTS_PURGE,
    job_types::BUILD_SITE,
];

#[derive(Debug, Serialize)]
pub struct EnqueueResult {
    pub job_id: String,
    pub job_type: String,
}

/// Enqueue a job by type with an optional JSON payload.
pub async fn enqueue_job(
    pool: &SqlitePool,
    job_type: &str,
    payload: Option<Value>,
    priority: i64,
) -> Result<EnqueueResult> {
    if !ENQUEUEABLE_TYPES.contains(&job_type) {
        return Err(Error::Validation(format!("unknown job type {job_type}")));
    }
    let idempotency_key = match job_type {
        job_types::EVENTS_REBUILD => Some("events_rebuild".to_string()),
        _ => None,
    };
    let job_id = queue::enqueue_job(
        pool,
        job_type,
        payload,
        EnqueueOptions {
            priority,
            idempotency_key,
            ..Default::default()
        },
    )
    .await?;
    Ok(EnqueueResult {
        job_id,
        job_type: job_type.to_string(),
    })
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Job> {
    queue::get_job(pool, job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
}

pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<&str>,
    limit: i64,
) -> Result<Vec<Job>> {
    let status = match status {
        Some(value) => Some(
            JobStatus::parse(value)
                .ok_or_else(|| Error::Validation(format!("unknown job status {value}")))?,
        ),
        None => None,
    };
    queue::list_jobs(pool, status, limit.clamp(1, 500)).await
}

pub async fn cancel_job(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let job = get_job(pool, job_id).await?;
    if job.status.is_terminal() {
        return Err(Error::Validation(format!(
            "job {job_id} is already {}",
            job.status.as_str()
        )));
    }
    queue::cancel_job(pool, job_id).await
}

#[derive(Debug, Serialize)]
pub struct CancelAllResult {
    pub queued_canceled: u64,
    pub running_signaled: u64,
}

pub async fn cancel_all(pool: &SqlitePool) -> Result<CancelAllResult> {
    let (queued_canceled, running_signaled) = queue::cancel_all_jobs(pool).await?;
    Ok(CancelAllResult {
        queued_canceled,
        running_signaled,
    })
}

/// Create or update a source definition.
pub async fn upsert_source(pool: &SqlitePool, source: &Source) -> Result<()> {
    if source.id.trim().is_empty() {
        return Err(Error::Validation("source id must not be empty".to_string()));
    }
    if source.url.trim().is_empty() {
        return Err(Error::Validation("source url must not be empty".to_string()));
    }
    if source.interval_minutes < 1 {
        return Err(Error::Validation(
            "interval_minutes must be at least 1".to_string(),
        ));
    }
    sources::upsert_source(pool, source).await
}

pub async fn list_sources(pool: &SqlitePool) -> Result<Vec<Source>> {
    sources::list_sources(pool, false).await
}

pub async fn unpause_source(pool: &SqlitePool, source_id: &str) -> Result<()> {
    sources::get_source(pool, source_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("source {source_id}")))?;
    sources::unpause_source(pool, source_id).await
}

/// Run a source through fetch/parse/filter in memory; persist nothing.
pub async fn test_source(pool: &SqlitePool, source_id: &str) -> Result<Value> {
    let config = params::load_runtime_config(pool).await?;
    ingest::run_test_source(pool, &config, source_id).await
}

pub async fn get_runtime_config(pool: &SqlitePool) -> Result<RuntimeConfig> {
    params::load_runtime_config(pool).await
}

pub async fn patch_runtime_config(pool: &SqlitePool, patch: Value) -> Result<RuntimeConfig> {
    params::patch_runtime_config(pool, patch).await
}

pub async fn run_cve_sync_now(pool: &SqlitePool, cve_id: Option<&str>) -> Result<EnqueueResult> {
    let payload = cve_id.map(|id| serde_json::json!({ "cve_id": id }));
    let job_id = queue::enqueue_job(
        pool,
        job_types::CVE_SYNC,
        payload,
        EnqueueOptions {
            debounce: true,
            ..Default::default()
        },
    )
    .await?;
    Ok(EnqueueResult {
        job_id,
        job_type: job_types::CVE_SYNC.to_string(),
    })
}

pub async fn rebuild_events_now(pool: &SqlitePool) -> Result<EnqueueResult> {
    enqueue_job(pool, job_types::EVENTS_REBUILD, None, 0).await
}

/// Purge weak events synchronously and report the count.
pub async fn purge_events_now(pool: &SqlitePool) -> Result<u64> {
    let config = params::load_runtime_config(pool).await?;
    events_engine::purge_events(pool, &config.events).await
}

/// Destructive clears, gated by content type name.
pub async fn clear_content(pool: &SqlitePool, content_type: &str) -> Result<u64> {
    match content_type {
        "articles" => articles::delete_all_articles(pool).await,
        "cves" => cves::delete_all_cves(pool).await,
        "events" => events::delete_all_generated_events(pool).await,
        other => Err(Error::Validation(format!(
            "unknown content type {other}; expected articles|cves|events"
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub articles: i64,
    pub cves: i64,
    pub events: i64,
    pub jobs_by_status: Vec<(String, i64)>,
    pub llm_runs_ok: i64,
    pub llm_runs_failed: i64,
}

pub async fn dashboard(pool: &SqlitePool) -> Result<Dashboard> {
    let (llm_runs_ok, llm_runs_failed) = llm::count_llm_runs(pool).await?;
    Ok(Dashboard {
        articles: articles::count_articles(pool).await?,
        cves: cves::count_cves(pool).await?,
        events: events::count_events(pool).await?,
        jobs_by_status: queue::job_status_counts(pool).await?,
        llm_runs_ok,
        llm_runs_failed,
    })
}

/// Source rows decorated with their latest health run, for the sources page.
#[derive(Debug, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub last_run_ok: Option<bool>,
    pub last_run_ts: Option<String>,
    pub last_error: Option<String>,
}

pub async fn source_statuses(pool: &SqlitePool) -> Result<Vec<SourceStatus>> {
    let all = sources::list_sources(pool, false).await?;
    let mut out = Vec::with_capacity(all.len());
    for source in all {
        let last = health::get_last_run(pool, &source.id).await?;
        out.push(SourceStatus {
            last_run_ok: last.as_ref().map(|r| r.ok),
            last_run_ts: last.as_ref().map(|r| r.ts.clone()),
            last_error: last.and_then(|r| r.last_error),
            source,
        });
    }
    Ok(out)
}
