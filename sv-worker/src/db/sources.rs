//! Source persistence
//!
//! Sources are configured upstream feeds. The scheduler asks for "due"
//! sources: enabled, not paused, and past `interval_minutes` since their
//! last fetch.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use sv_common::models::{Source, SourceKind};
use sv_common::time::{now_iso, now_plus_seconds_iso};
use sv_common::{Error, Result};

const SOURCE_COLUMNS: &str = "id, name, kind, url, enabled, interval_minutes, tags_json, \
     pause_until, paused_reason, user_agent, http_headers_json, timeout_seconds, \
     allow_keywords_json, deny_keywords_json, min_interval_seconds, html_item_selector, \
     etag, last_modified, last_fetch_at";

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let kind_str: String = row.try_get("kind")?;
    let kind = SourceKind::parse(&kind_str)
        .ok_or_else(|| Error::Internal(format!("unknown source kind {kind_str}")))?;
    let tags_json: String = row.try_get("tags_json")?;
    let headers_json: String = row.try_get("http_headers_json")?;
    let allow_json: String = row.try_get("allow_keywords_json")?;
    let deny_json: String = row.try_get("deny_keywords_json")?;
    let enabled: i64 = row.try_get("enabled")?;
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
        url: row.try_get("url")?,
        enabled: enabled != 0,
        interval_minutes: row.try_get("interval_minutes")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        pause_until: row.try_get("pause_until")?,
        paused_reason: row.try_get("paused_reason")?,
        user_agent: row.try_get("user_agent")?,
        http_headers: serde_json::from_str::<BTreeMap<String, String>>(&headers_json)
            .unwrap_or_default(),
        timeout_seconds: row.try_get("timeout_seconds")?,
        allow_keywords: serde_json::from_str(&allow_json).unwrap_or_default(),
        deny_keywords: serde_json::from_str(&deny_json).unwrap_or_default(),
        min_interval_seconds: row.try_get("min_interval_seconds")?,
        html_item_selector: row.try_get("html_item_selector")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        last_fetch_at: row.try_get("last_fetch_at")?,
    })
}

/// Insert or update a source by id. Supplied fields overwrite; the pause
/// state and cache validators are managed by their own operations and are
/// left untouched here.
pub async fn upsert_source(pool: &SqlitePool, source: &Source) -> Result<()> {
    let now = now_iso();
    sqlx::query(
        r#"
        INSERT INTO sources (id, name, kind, url, enabled, interval_minutes, tags_json,
                             user_agent, http_headers_json, timeout_seconds,
                             allow_keywords_json, deny_keywords_json, min_interval_seconds,
                             html_item_selector, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            kind = excluded.kind,
            url = excluded.url,
            enabled = excluded.enabled,
            interval_minutes = excluded.interval_minutes,
            tags_json = excluded.tags_json,
            user_agent = excluded.user_agent,
            http_headers_json = excluded.http_headers_json,
            timeout_seconds = excluded.timeout_seconds,
            allow_keywords_json = excluded.allow_keywords_json,
            deny_keywords_json = excluded.deny_keywords_json,
            min_interval_seconds = excluded.min_interval_seconds,
            html_item_selector = excluded.html_item_selector,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&source.id)
    .bind(&source.name)
    .bind(source.kind.as_str())
    .bind(&source.url)
    .bind(source.enabled as i64)
    .bind(source.interval_minutes)
    .bind(serde_json::to_string(&source.tags).unwrap_or_else(|_| "[]".into()))
    .bind(&source.user_agent)
    .bind(serde_json::to_string(&source.http_headers).unwrap_or_else(|_| "{}".into()))
    .bind(source.timeout_seconds)
    .bind(serde_json::to_string(&source.allow_keywords).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&source.deny_keywords).unwrap_or_else(|_| "[]".into()))
    .bind(source.min_interval_seconds)
    .bind(&source.html_item_selector)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_source(pool: &SqlitePool, source_id: &str) -> Result<Option<Source>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_source(&r)).transpose()
}

pub async fn list_sources(pool: &SqlitePool, enabled_only: bool) -> Result<Vec<Source>> {
    let sql = if enabled_only {
        format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE enabled = 1 ORDER BY id")
    } else {
        format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id")
    };
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_source).collect()
}

/// Sources due for ingest: enabled, not paused, and past their interval.
pub async fn list_due_sources(pool: &SqlitePool, now: &str) -> Result<Vec<Source>> {
    let sql = format!(
        r#"
        SELECT {SOURCE_COLUMNS} FROM sources
        WHERE enabled = 1
          AND (pause_until IS NULL OR pause_until <= ?)
          AND (last_fetch_at IS NULL
               OR datetime(last_fetch_at, '+' || interval_minutes || ' minutes') <= datetime(?))
        ORDER BY id
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(now)
        .bind(now)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_source).collect()
}

/// Pause a source for `pause_minutes` with a reason.
pub async fn pause_source(
    pool: &SqlitePool,
    source_id: &str,
    reason: &str,
    pause_minutes: i64,
) -> Result<()> {
    sqlx::query("UPDATE sources SET pause_until = ?, paused_reason = ?, updated_at = ? WHERE id = ?")
        .bind(now_plus_seconds_iso(pause_minutes * 60))
        .bind(reason)
        .bind(now_iso())
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear any pause, letting the scheduler pick the source up again.
pub async fn unpause_source(pool: &SqlitePool, source_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sources SET pause_until = NULL, paused_reason = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now_iso())
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record HTTP cache validators and the fetch time after a successful fetch.
pub async fn record_fetch_validators(
    pool: &SqlitePool,
    source_id: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sources SET etag = COALESCE(?, etag),
                            last_modified = COALESCE(?, last_modified),
                            last_fetch_at = ?
         WHERE id = ?",
    )
    .bind(etag)
    .bind(last_modified)
    .bind(now_iso())
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a source and its dependent link/health rows. Article rows remain.
pub async fn delete_source(pool: &SqlitePool, source_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM source_health WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM health_alerts WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM sources WHERE id = ?")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(deleted.rows_affected() == 1)
}

pub async fn get_source_name(pool: &SqlitePool, source_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT name FROM sources WHERE id = ?")
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(name,)| name))
}
