//! Durable typed job queue
//!
//! The queue is the `jobs` table. Workers claim rows with a single atomic
//! UPDATE so two workers can never return the same job; a claimed row holds
//! a time-bound lease that the worker renews while the handler runs. A lease
//! that expires without renewal makes the row claimable again, which is why
//! every handler must be idempotent or protected by an idempotency key.

use rand::Rng;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use sv_common::db::settings::{get_setting, set_setting};
use sv_common::models::{Job, JobStatus};
use sv_common::time::{now_iso, now_plus_seconds_iso, parse_iso};
use sv_common::{Error, Result};
use tracing::{debug, info};
use uuid::Uuid;

/// Job type names served by the workers.
pub mod job_types {
    pub const INGEST_DUE_SOURCES: &str = "ingest_due_sources";
    pub const INGEST_SOURCE: &str = "ingest_source";
    pub const FETCH_ARTICLE_CONTENT: &str = "fetch_article_content";
    pub const SUMMARIZE_ARTICLE_LLM: &str = "summarize_article_llm";
    pub const WRITE_ARTICLE_MARKDOWN: &str = "write_article_markdown";
    pub const CVE_SYNC: &str = "cve_sync";
    pub const EVENTS_REBUILD: &str = "events_rebuild";
    pub const EVENTS_PURGE: &str = "events_purge";
    pub const BUILD_SITE: &str = "build_site";
}

/// Options for [`enqueue_job`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i64,
    /// Earliest time the job may be claimed; defaults to now.
    pub run_after: Option<String>,
    pub max_attempts: Option<i64>,
    /// At most one queued-or-running job may hold a given key.
    pub idempotency_key: Option<String>,
    /// Skip the insert when a queued/running job of the same type exists.
    pub debounce: bool,
}

fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let payload_json: Option<String> = row.try_get("payload_json")?;
    let result_json: Option<String> = row.try_get("result_json")?;
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| Error::Internal(format!("unknown job status {status_str}")))?;
    let cancel_requested: i64 = row.try_get("cancel_requested")?;
    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload: payload_json
            .and_then(|p| serde_json::from_str(&p).ok())
            .unwrap_or(Value::Null),
        status,
        priority: row.try_get("priority")?,
        requested_at: row.try_get("requested_at")?,
        run_after: row.try_get("run_after")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        cancel_requested: cancel_requested != 0,
        idempotency_key: row.try_get("idempotency_key")?,
        result: result_json.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.try_get("error")?,
    })
}

const JOB_COLUMNS: &str = "id, job_type, payload_json, status, priority, requested_at, run_after, \
     started_at, finished_at, attempts, max_attempts, lease_owner, lease_expires_at, \
     cancel_requested, idempotency_key, result_json, error";

/// Enqueue a job, returning its id.
///
/// With `debounce`, an existing queued/running job of the same type is
/// returned instead of inserting a second one. With an `idempotency_key`,
/// the partial unique index enforces the same property across processes and
/// the existing active job id is returned on conflict.
pub async fn enqueue_job(
    pool: &SqlitePool,
    job_type: &str,
    payload: Option<Value>,
    options: EnqueueOptions,
) -> Result<String> {
    if options.debounce {
        if let Some(existing) = latest_pending_job_id(pool, job_type).await? {
            debug!(job_type, existing, "enqueue debounced");
            return Ok(existing);
        }
    }

    let job_id = new_job_id();
    let now = now_iso();
    let run_after = options.run_after.unwrap_or_else(|| now.clone());
    let payload_json = serde_json::to_string(&payload.unwrap_or(Value::Null))
        .map_err(|e| Error::Internal(format!("payload serialization failed: {e}")))?;
    let insert = sqlx::query(
        r#"
        INSERT INTO jobs (id, job_type, payload_json, status, priority, requested_at, run_after,
                          attempts, max_attempts, cancel_requested, idempotency_key)
        VALUES (?, ?, ?, 'queued', ?, ?, ?, 0, ?, 0, ?)
        "#,
    )
    .bind(&job_id)
    .bind(job_type)
    .bind(&payload_json)
    .bind(options.priority)
    .bind(&now)
    .bind(&run_after)
    .bind(options.max_attempts.unwrap_or(5))
    .bind(&options.idempotency_key)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => Ok(job_id),
        Err(sqlx::Error::Database(db_err))
            if db_err.message().contains("UNIQUE") && db_err.message().contains("idempotency") =>
        {
            let key = options.idempotency_key.as_deref().unwrap_or_default();
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE idempotency_key = ? AND status IN ('queued', 'running') LIMIT 1",
            )
            .bind(key)
            .fetch_optional(pool)
            .await?;
            existing.map(|(id,)| id).ok_or_else(|| {
                Error::Transient("idempotent enqueue raced a finishing job".to_string())
            })
        }
        Err(e) => Err(e.into()),
    }
}

async fn latest_pending_job_id(pool: &SqlitePool, job_type: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM jobs WHERE job_type = ? AND status IN ('queued', 'running')
         ORDER BY requested_at DESC LIMIT 1",
    )
    .bind(job_type)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

/// True when a queued or running job of this type exists.
pub async fn has_pending_job(
    pool: &SqlitePool,
    job_type: &str,
    exclude_job_id: Option<&str>,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM jobs WHERE job_type = ? AND status IN ('queued', 'running') AND id != ? LIMIT 1",
    )
    .bind(job_type)
    .bind(exclude_job_id.unwrap_or(""))
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// True when a queued/running job of this type references the article.
pub async fn has_pending_article_job(
    pool: &SqlitePool,
    job_type: &str,
    article_id: &str,
) -> Result<bool> {
    let pattern = format!("%\"article_id\":\"{article_id}\"%");
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM jobs WHERE job_type = ? AND status IN ('queued', 'running')
         AND payload_json LIKE ? LIMIT 1",
    )
    .bind(job_type)
    .bind(pattern)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Debounced build enqueue: many writers in a window produce one build.
///
/// Skips when a build job is already pending, or when one was enqueued less
/// than `debounce_seconds` ago; otherwise enqueues with a short `run_after`
/// delay so the build absorbs the whole burst.
pub async fn enqueue_build_site_if_needed(
    pool: &SqlitePool,
    reason: &str,
    debounce_seconds: i64,
) -> Result<Option<String>> {
    if has_pending_job(pool, job_types::BUILD_SITE, None).await? {
        return Ok(None);
    }
    let now = now_iso();
    let last: Option<String> = get_setting(pool, "build_site.last_enqueued_at").await?;
    if let Some(last) = last {
        if let (Some(last_dt), Some(now_dt)) = (parse_iso(&last), parse_iso(&now)) {
            if (now_dt - last_dt).num_seconds() < debounce_seconds {
                return Ok(None);
            }
        }
    }
    let job_id = enqueue_job(
        pool,
        job_types::BUILD_SITE,
        Some(serde_json::json!({ "reason": reason })),
        EnqueueOptions {
            run_after: Some(now_plus_seconds_iso(debounce_seconds)),
            debounce: true,
            ..Default::default()
        },
    )
    .await?;
    set_setting(pool, "build_site.last_enqueued_at", &now).await?;
    Ok(Some(job_id))
}

/// Atomically claim the next runnable job for this worker.
///
/// One statement finds the best row (priority desc, FIFO within priority),
/// including `running` rows whose lease has expired, and flips it to this
/// worker. Zero rows affected means no work; a concurrent claim of the same
/// row makes the guarded UPDATE match nothing, so the loser simply retries.
pub async fn claim_next_job(
    pool: &SqlitePool,
    worker_id: &str,
    allowed_types: &[&str],
    lease_ttl_seconds: i64,
) -> Result<Option<Job>> {
    if allowed_types.is_empty() {
        return Ok(None);
    }
    let now = now_iso();
    let lease_expires = now_plus_seconds_iso(lease_ttl_seconds);
    let placeholders = allowed_types
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        UPDATE jobs SET
            status = 'running',
            lease_owner = ?,
            lease_expires_at = ?,
            started_at = COALESCE(started_at, ?),
            attempts = attempts + 1
        WHERE id = (
            SELECT id FROM jobs
            WHERE (status = 'queued'
                   OR (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?))
              AND cancel_requested = 0
              AND run_after <= ?
              AND job_type IN ({placeholders})
            ORDER BY priority DESC, requested_at ASC
            LIMIT 1
        )
        AND (status = 'queued'
             OR (status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?))
        RETURNING {JOB_COLUMNS}
        "#
    );
    let mut query = sqlx::query(&sql)
        .bind(worker_id)
        .bind(&lease_expires)
        .bind(&now)
        .bind(&now)
        .bind(&now);
    for job_type in allowed_types {
        query = query.bind(*job_type);
    }
    query = query.bind(&now);

    let row = query.fetch_optional(pool).await?;
    match row {
        Some(row) => {
            let job = row_to_job(&row)?;
            debug!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job claimed");
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Extend the lease on a running job. False when the job is no longer ours.
pub async fn renew_lease(
    pool: &SqlitePool,
    job_id: &str,
    worker_id: &str,
    lease_ttl_seconds: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET lease_expires_at = ?
         WHERE id = ? AND status = 'running' AND lease_owner = ?",
    )
    .bind(now_plus_seconds_iso(lease_ttl_seconds))
    .bind(job_id)
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Whether an in-flight cancel has been requested for this job.
pub async fn is_cancel_requested(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT cancel_requested FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;
    Ok(matches!(row, Some((flag,)) if flag != 0))
}

/// Mark a running job succeeded. False when the row was not ours anymore.
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: &str,
    result: Option<&Value>,
) -> Result<bool> {
    let result_json = match result {
        Some(value) => Some(
            serde_json::to_string(value)
                .map_err(|e| Error::Internal(format!("result serialization failed: {e}")))?,
        ),
        None => None,
    };
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'succeeded', finished_at = ?, error = NULL, result_json = ?,
                         lease_owner = NULL, lease_expires_at = NULL
         WHERE id = ? AND status = 'running'",
    )
    .bind(now_iso())
    .bind(result_json)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Attach an interim result to a running job without changing its status.
///
/// Used by long handlers (site build) so partial output survives a later
/// failure.
pub async fn update_job_result(pool: &SqlitePool, job_id: &str, result: &Value) -> Result<bool> {
    let result_json = serde_json::to_string(result)
        .map_err(|e| Error::Internal(format!("result serialization failed: {e}")))?;
    let updated = sqlx::query("UPDATE jobs SET result_json = ? WHERE id = ? AND status = 'running'")
        .bind(result_json)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(updated.rows_affected() == 1)
}

/// Mark a running job failed, keeping any partial result for post-mortem.
pub async fn fail_job(
    pool: &SqlitePool,
    job_id: &str,
    error: &str,
    result: Option<&Value>,
) -> Result<bool> {
    let result_json = result.and_then(|value| serde_json::to_string(value).ok());
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'failed', finished_at = ?, error = ?,
                         result_json = COALESCE(?, result_json),
                         lease_owner = NULL, lease_expires_at = NULL
         WHERE id = ? AND status = 'running'",
    )
    .bind(now_iso())
    .bind(error)
    .bind(result_json)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Mark a job canceled. Works on queued and running rows.
pub async fn mark_canceled(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?,
                         lease_owner = NULL, lease_expires_at = NULL
         WHERE id = ? AND status IN ('queued', 'running')",
    )
    .bind(now_iso())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() == 1)
}

/// Requeue a running job with exponential backoff.
///
/// `run_after = now + base * 2^(attempts-1) ± jitter`, capped. A
/// `retry_after` override (from a Retry-After header) wins over the computed
/// delay when it is longer.
pub async fn requeue_with_backoff(
    pool: &SqlitePool,
    job: &Job,
    base_seconds: i64,
    cap_seconds: i64,
    retry_after_seconds: Option<u64>,
) -> Result<String> {
    let exponent = (job.attempts - 1).clamp(0, 20) as u32;
    let mut delay = base_seconds.saturating_mul(1i64 << exponent).min(cap_seconds);
    if let Some(retry_after) = retry_after_seconds {
        delay = delay.max(retry_after as i64).min(cap_seconds);
    }
    // ±25% jitter keeps a burst of retries from re-colliding.
    let jitter_span = (delay / 4).max(1);
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let delay = (delay + jitter).max(1);
    let run_after = now_plus_seconds_iso(delay);

    sqlx::query(
        "UPDATE jobs SET status = 'queued', run_after = ?,
                         lease_owner = NULL, lease_expires_at = NULL,
                         started_at = NULL, error = ?
         WHERE id = ? AND status = 'running'",
    )
    .bind(&run_after)
    .bind(format!("retry scheduled (attempt {})", job.attempts))
    .bind(&job.id)
    .execute(pool)
    .await?;
    Ok(run_after)
}

/// Cancel one job: queued rows flip to `canceled` directly; running rows get
/// a cancel intent that the owning worker's lease loop observes.
pub async fn cancel_job(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let queued = sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?, cancel_requested = 1
         WHERE id = ? AND status = 'queued'",
    )
    .bind(now_iso())
    .bind(job_id)
    .execute(pool)
    .await?;
    if queued.rows_affected() == 1 {
        info!(job_id, "queued job canceled");
        return Ok(true);
    }
    let running = sqlx::query(
        "UPDATE jobs SET cancel_requested = 1 WHERE id = ? AND status = 'running'",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(running.rows_affected() == 1)
}

/// Bulk cancel: every queued job flips to `canceled`, every running job gets
/// the cancel intent. Returns (queued_canceled, running_signaled).
pub async fn cancel_all_jobs(pool: &SqlitePool) -> Result<(u64, u64)> {
    let queued = sqlx::query(
        "UPDATE jobs SET status = 'canceled', finished_at = ?, cancel_requested = 1
         WHERE status = 'queued'",
    )
    .bind(now_iso())
    .execute(pool)
    .await?;
    let running =
        sqlx::query("UPDATE jobs SET cancel_requested = 1 WHERE status = 'running'")
            .execute(pool)
            .await?;
    info!(
        queued = queued.rows_affected(),
        running = running.rows_affected(),
        "cancel-all issued"
    );
    Ok((queued.rows_affected(), running.rows_affected()))
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;
    row.map(|r| row_to_job(&r)).transpose()
}

/// Recent jobs, newest first, optionally filtered by status.
pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<JobStatus>,
    limit: i64,
) -> Result<Vec<Job>> {
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY requested_at DESC LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql =
                format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY requested_at DESC LIMIT ?");
            sqlx::query(&sql).bind(limit).fetch_all(pool).await?
        }
    };
    rows.iter().map(row_to_job).collect()
}

/// Per-status job counts for the dashboard.
pub async fn job_status_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
