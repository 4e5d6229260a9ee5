//! Source health journal and auto-pause streaks

use sqlx::SqlitePool;
use sv_common::models::SourceHealth;
use sv_common::time::now_iso;
use sv_common::Result;

/// Consecutive-failure counters derived from the most recent runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStreaks {
    pub consecutive_errors: i64,
    pub consecutive_zero_articles: i64,
}

pub async fn insert_health_run(pool: &SqlitePool, run: &SourceHealth) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO source_health (source_id, ts, ok, http_status, found_count, accepted_count,
                                   seen_count, filtered_count, error_count, duration_ms, last_error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run.source_id)
    .bind(&run.ts)
    .bind(run.ok as i64)
    .bind(run.http_status)
    .bind(run.found_count)
    .bind(run.accepted_count)
    .bind(run.seen_count)
    .bind(run.filtered_count)
    .bind(run.error_count)
    .bind(run.duration_ms)
    .bind(&run.last_error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_recent_runs(
    pool: &SqlitePool,
    source_id: &str,
    limit: i64,
) -> Result<Vec<SourceHealth>> {
    let rows: Vec<(
        String,
        String,
        i64,
        Option<i64>,
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT source_id, ts, ok, http_status, found_count, accepted_count, seen_count,
                filtered_count, error_count, duration_ms, last_error
         FROM source_health WHERE source_id = ? ORDER BY ts DESC, id DESC LIMIT ?",
    )
    .bind(source_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(source_id, ts, ok, http_status, found_count, accepted_count, seen_count, filtered_count, error_count, duration_ms, last_error)| {
                SourceHealth {
                    source_id,
                    ts,
                    ok: ok != 0,
                    http_status,
                    found_count,
                    accepted_count,
                    seen_count,
                    filtered_count,
                    error_count,
                    duration_ms,
                    last_error,
                }
            },
        )
        .collect())
}

/// Walk the most recent runs (newest first) counting consecutive errors and
/// consecutive zero-article successes. Each streak stops at the first run
/// that breaks it.
pub async fn get_run_streaks(pool: &SqlitePool, source_id: &str) -> Result<RunStreaks> {
    let runs = list_recent_runs(pool, source_id, 20).await?;
    let mut streaks = RunStreaks::default();
    for run in &runs {
        if run.ok {
            break;
        }
        streaks.consecutive_errors += 1;
    }
    for run in &runs {
        if !run.ok || run.accepted_count > 0 {
            break;
        }
        streaks.consecutive_zero_articles += 1;
    }
    Ok(streaks)
}

pub async fn record_health_alert(
    pool: &SqlitePool,
    source_id: &str,
    alert_type: &str,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO health_alerts (source_id, alert_type, message, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(source_id)
    .bind(alert_type)
    .bind(message)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

/// Latest run per source, for the sources dashboard.
pub async fn get_last_run(pool: &SqlitePool, source_id: &str) -> Result<Option<SourceHealth>> {
    Ok(list_recent_runs(pool, source_id, 1).await?.into_iter().next())
}
