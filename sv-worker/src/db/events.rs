//! Event persistence
//!
//! Events own their link tables; deleting an event deletes its links.
//! `manual` events are written only by operators and are never touched by
//! the correlation engine or the purge.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use sv_common::models::{Event, EventKind, EventStatus, LinkMeta};
use sv_common::time::now_iso;
use sv_common::{Error, Result};
use uuid::Uuid;

const EVENT_COLUMNS: &str =
    "id, event_key, kind, title, summary, severity, status, first_seen_at, last_seen_at, status_changed_at";

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let kind_str: String = row.try_get("kind")?;
    let status_str: String = row.try_get("status")?;
    Ok(Event {
        id: row.try_get("id")?,
        event_key: row.try_get("event_key")?,
        kind: EventKind::parse(&kind_str)
            .ok_or_else(|| Error::Internal(format!("unknown event kind {kind_str}")))?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        severity: row.try_get("severity")?,
        status: EventStatus::parse(&status_str)
            .ok_or_else(|| Error::Internal(format!("unknown event status {status_str}")))?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        status_changed_at: row.try_get("status_changed_at")?,
    })
}

pub async fn get_event(pool: &SqlitePool, event_id: &str) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?");
    let row = sqlx::query(&sql).bind(event_id).fetch_optional(pool).await?;
    row.map(|r| row_to_event(&r)).transpose()
}

pub async fn get_event_by_key(pool: &SqlitePool, event_key: &str) -> Result<Option<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_key = ?");
    let row = sqlx::query(&sql)
        .bind(event_key)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_event(&r)).transpose()
}

pub async fn list_events(pool: &SqlitePool) -> Result<Vec<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY last_seen_at DESC, id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_event).collect()
}

/// Create a manual event (operator-authored; exempt from rebuild and purge).
pub async fn create_manual_event(
    pool: &SqlitePool,
    title: &str,
    summary: Option<&str>,
    severity: Option<&str>,
) -> Result<Event> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    let event = Event {
        id: id.clone(),
        event_key: format!("manual:{id}"),
        kind: EventKind::Manual,
        title: title.to_string(),
        summary: summary.map(str::to_string),
        severity: severity.map(str::to_string),
        status: EventStatus::Active,
        first_seen_at: now.clone(),
        last_seen_at: now.clone(),
        status_changed_at: now,
    };
    sqlx::query(
        r#"
        INSERT INTO events (id, event_key, kind, title, summary, severity, status,
                            first_seen_at, last_seen_at, status_changed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.event_key)
    .bind(event.kind.as_str())
    .bind(&event.title)
    .bind(&event.summary)
    .bind(&event.severity)
    .bind(event.status.as_str())
    .bind(&event.first_seen_at)
    .bind(&event.last_seen_at)
    .bind(&event.status_changed_at)
    .execute(pool)
    .await?;
    Ok(event)
}

/// Upsert an event row inside a rebuild transaction.
///
/// Returns the event id. An existing `manual` row wins: its fields are left
/// untouched and None is returned so the caller skips link replacement too.
pub async fn upsert_event_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
) -> Result<Option<String>> {
    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT id, kind FROM events WHERE event_key = ?")
            .bind(&event.event_key)
            .fetch_optional(&mut **tx)
            .await?;
    if let Some((id, kind)) = existing {
        if kind == EventKind::Manual.as_str() {
            return Ok(None);
        }
        sqlx::query(
            r#"
            UPDATE events SET kind = ?, title = ?, summary = ?, severity = ?, status = ?,
                              first_seen_at = ?, last_seen_at = ?, status_changed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(event.kind.as_str())
        .bind(&event.title)
        .bind(&event.summary)
        .bind(&event.severity)
        .bind(event.status.as_str())
        .bind(&event.first_seen_at)
        .bind(&event.last_seen_at)
        .bind(&event.status_changed_at)
        .bind(&id)
        .execute(&mut **tx)
        .await?;
        return Ok(Some(id));
    }
    sqlx::query(
        r#"
        INSERT INTO events (id, event_key, kind, title, summary, severity, status,
                            first_seen_at, last_seen_at, status_changed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.event_key)
    .bind(event.kind.as_str())
    .bind(&event.title)
    .bind(&event.summary)
    .bind(&event.severity)
    .bind(event.status.as_str())
    .bind(&event.first_seen_at)
    .bind(&event.last_seen_at)
    .bind(&event.status_changed_at)
    .execute(&mut **tx)
    .await?;
    Ok(Some(event.id.clone()))
}

/// Drop and re-create an event's link rows inside a rebuild transaction.
pub async fn replace_event_links_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: &str,
    cves: &[(String, LinkMeta)],
    products: &[String],
    articles: &[(String, LinkMeta)],
) -> Result<()> {
    sqlx::query("DELETE FROM event_cves WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM event_products WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM event_articles WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    for (cve_id, meta) in cves {
        sqlx::query(
            r#"
            INSERT INTO event_cves (event_id, cve_id, confidence, confidence_band,
                                    reasons_json, evidence_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_id)
        .bind(cve_id)
        .bind(meta.confidence)
        .bind(&meta.confidence_band)
        .bind(serde_json::to_string(&meta.reasons).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&meta.evidence).unwrap_or_else(|_| "{}".into()))
        .execute(&mut **tx)
        .await?;
    }
    for product in products {
        sqlx::query("INSERT INTO event_products (event_id, product_key) VALUES (?, ?)")
            .bind(event_id)
            .bind(product)
            .execute(&mut **tx)
            .await?;
    }
    for (article_id, meta) in articles {
        sqlx::query(
            r#"
            INSERT INTO event_articles (event_id, article_id, confidence, confidence_band,
                                        reasons_json, evidence_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_id)
        .bind(article_id)
        .bind(meta.confidence)
        .bind(&meta.confidence_band)
        .bind(serde_json::to_string(&meta.reasons).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&meta.evidence).unwrap_or_else(|_| "{}".into()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Delete an event and its links inside a transaction.
pub async fn delete_event_in_tx(tx: &mut Transaction<'_, Sqlite>, event_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM event_cves WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM event_products WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM event_articles WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM events WHERE id = ?")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Flag active events containing any of these CVEs as pending a summary
/// refresh. The next rebuild recomputes their summaries and resolves them
/// back to active.
pub async fn mark_events_updating_for_cves(
    pool: &SqlitePool,
    cve_ids: &[String],
) -> Result<u64> {
    let mut updated = 0;
    for cve_id in cve_ids {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'updating', status_changed_at = ?
            WHERE status = 'active' AND kind != 'manual'
              AND id IN (SELECT event_id FROM event_cves WHERE cve_id = ?)
            "#,
        )
        .bind(now_iso())
        .bind(cve_id)
        .execute(pool)
        .await?;
        updated += result.rows_affected();
    }
    Ok(updated)
}

pub async fn list_event_cve_ids(pool: &SqlitePool, event_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT cve_id FROM event_cves WHERE event_id = ? ORDER BY cve_id")
            .bind(event_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn list_event_product_keys(pool: &SqlitePool, event_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT product_key FROM event_products WHERE event_id = ? ORDER BY product_key",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn list_event_article_ids(pool: &SqlitePool, event_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT article_id FROM event_articles WHERE event_id = ? ORDER BY article_id",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn count_event_articles(pool: &SqlitePool, event_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM event_articles WHERE event_id = ?")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn count_events(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Admin purge: remove all non-manual events and their links.
pub async fn delete_all_generated_events(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let ids: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM events WHERE kind != 'manual'")
            .fetch_all(&mut *tx)
            .await?;
    let count = ids.len() as u64;
    for (id,) in ids {
        delete_event_in_tx(&mut tx, &id).await?;
    }
    tx.commit().await?;
    Ok(count)
}
