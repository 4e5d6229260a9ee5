//! CVE persistence and the change journal
//!
//! The CVE row is the canonical upstream snapshot; `snapshot_hash` gates the
//! change journal so re-syncing identical data writes nothing.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use sv_common::models::{AffectedProduct, Cve, CveChange, CvssMetric};
use sv_common::time::now_iso;
use sv_common::Result;

const CVE_COLUMNS: &str = "cve_id, published_at, last_modified_at, last_seen_at, \
     description_text, preferred_cvss_version, preferred_base_score, preferred_base_severity, \
     preferred_vector, cvss_v31_json, cvss_v40_json, affected_products_json, affected_cpes_json, \
     reference_domains_json, snapshot_hash";

fn row_to_cve(row: &SqliteRow) -> Result<Cve> {
    let v31_json: Option<String> = row.try_get("cvss_v31_json")?;
    let v40_json: Option<String> = row.try_get("cvss_v40_json")?;
    let products_json: String = row.try_get("affected_products_json")?;
    let cpes_json: String = row.try_get("affected_cpes_json")?;
    let domains_json: String = row.try_get("reference_domains_json")?;
    Ok(Cve {
        cve_id: row.try_get("cve_id")?,
        published_at: row.try_get("published_at")?,
        last_modified_at: row.try_get("last_modified_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        description_text: row.try_get("description_text")?,
        preferred_cvss_version: row.try_get("preferred_cvss_version")?,
        preferred_base_score: row.try_get("preferred_base_score")?,
        preferred_base_severity: row.try_get("preferred_base_severity")?,
        preferred_vector: row.try_get("preferred_vector")?,
        cvss_v31: v31_json.and_then(|j| serde_json::from_str::<CvssMetric>(&j).ok()),
        cvss_v40: v40_json.and_then(|j| serde_json::from_str::<CvssMetric>(&j).ok()),
        affected_products: serde_json::from_str::<Vec<AffectedProduct>>(&products_json)
            .unwrap_or_default(),
        affected_cpes: serde_json::from_str(&cpes_json).unwrap_or_default(),
        reference_domains: serde_json::from_str(&domains_json).unwrap_or_default(),
        snapshot_hash: row.try_get("snapshot_hash")?,
    })
}

pub async fn get_cve(pool: &SqlitePool, cve_id: &str) -> Result<Option<Cve>> {
    let sql = format!("SELECT {CVE_COLUMNS} FROM cves WHERE cve_id = ?");
    let row = sqlx::query(&sql).bind(cve_id).fetch_optional(pool).await?;
    row.map(|r| row_to_cve(&r)).transpose()
}

/// Upsert a minimal stub for a CVE first seen in article text.
///
/// Only touches `last_seen_at` when the row already exists, so a later full
/// sync is not clobbered by stub re-inserts.
pub async fn upsert_cve_stub(pool: &SqlitePool, cve_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cves (cve_id, last_seen_at)
        VALUES (?, ?)
        ON CONFLICT(cve_id) DO UPDATE SET last_seen_at = excluded.last_seen_at
        "#,
    )
    .bind(cve_id)
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

/// Full upsert from a canonicalized upstream record.
pub async fn upsert_cve(pool: &SqlitePool, cve: &Cve, raw_json: Option<&str>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cves (cve_id, published_at, last_modified_at, last_seen_at, description_text,
                          preferred_cvss_version, preferred_base_score, preferred_base_severity,
                          preferred_vector, cvss_v31_json, cvss_v40_json, affected_products_json,
                          affected_cpes_json, reference_domains_json, raw_json, snapshot_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(cve_id) DO UPDATE SET
            published_at = COALESCE(excluded.published_at, cves.published_at),
            last_modified_at = COALESCE(excluded.last_modified_at, cves.last_modified_at),
            last_seen_at = excluded.last_seen_at,
            description_text = COALESCE(excluded.description_text, cves.description_text),
            preferred_cvss_version = excluded.preferred_cvss_version,
            preferred_base_score = excluded.preferred_base_score,
            preferred_base_severity = excluded.preferred_base_severity,
            preferred_vector = excluded.preferred_vector,
            cvss_v31_json = COALESCE(excluded.cvss_v31_json, cves.cvss_v31_json),
            cvss_v40_json = COALESCE(excluded.cvss_v40_json, cves.cvss_v40_json),
            affected_products_json = excluded.affected_products_json,
            affected_cpes_json = excluded.affected_cpes_json,
            reference_domains_json = excluded.reference_domains_json,
            raw_json = COALESCE(excluded.raw_json, cves.raw_json),
            snapshot_hash = excluded.snapshot_hash
        "#,
    )
    .bind(&cve.cve_id)
    .bind(&cve.published_at)
    .bind(&cve.last_modified_at)
    .bind(&cve.last_seen_at)
    .bind(&cve.description_text)
    .bind(&cve.preferred_cvss_version)
    .bind(cve.preferred_base_score)
    .bind(&cve.preferred_base_severity)
    .bind(&cve.preferred_vector)
    .bind(cve.cvss_v31.as_ref().and_then(|m| serde_json::to_string(m).ok()))
    .bind(cve.cvss_v40.as_ref().and_then(|m| serde_json::to_string(m).ok()))
    .bind(serde_json::to_string(&cve.affected_products).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&cve.affected_cpes).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&cve.reference_domains).unwrap_or_else(|_| "[]".into()))
    .bind(raw_json)
    .bind(&cve.snapshot_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_cve_change(pool: &SqlitePool, change: &CveChange) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cve_changes (cve_id, change_at, change_type, cvss_version, from_score,
                                 to_score, from_severity, to_severity, vector_from, vector_to,
                                 detail_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&change.cve_id)
    .bind(&change.change_at)
    .bind(&change.change_type)
    .bind(&change.cvss_version)
    .bind(change.from_score)
    .bind(change.to_score)
    .bind(&change.from_severity)
    .bind(&change.to_severity)
    .bind(&change.vector_from)
    .bind(&change.vector_to)
    .bind(serde_json::to_string(&change.detail).unwrap_or_else(|_| "{}".into()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_cve_changes(pool: &SqlitePool, cve_id: &str) -> Result<Vec<CveChange>> {
    let rows: Vec<(
        String,
        String,
        String,
        Option<String>,
        Option<f64>,
        Option<f64>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
    )> = sqlx::query_as(
        "SELECT cve_id, change_at, change_type, cvss_version, from_score, to_score,
                from_severity, to_severity, vector_from, vector_to, detail_json
         FROM cve_changes WHERE cve_id = ? ORDER BY change_at, id",
    )
    .bind(cve_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(cve_id, change_at, change_type, cvss_version, from_score, to_score, from_severity, to_severity, vector_from, vector_to, detail_json)| {
                CveChange {
                    cve_id,
                    change_at,
                    change_type,
                    cvss_version,
                    from_score,
                    to_score,
                    from_severity,
                    to_severity,
                    vector_from,
                    vector_to,
                    detail: serde_json::from_str(&detail_json).unwrap_or_default(),
                }
            },
        )
        .collect())
}

/// All CVEs with their timeline fields, for the correlation engine.
pub async fn list_cves(pool: &SqlitePool) -> Result<Vec<Cve>> {
    let sql = format!("SELECT {CVE_COLUMNS} FROM cves ORDER BY COALESCE(published_at, last_seen_at), cve_id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_cve).collect()
}

/// Minimal CVE rows for the JSON search index, newest first.
pub async fn list_cves_for_index(pool: &SqlitePool, limit: i64) -> Result<Vec<serde_json::Value>> {
    let sql = format!(
        "SELECT {CVE_COLUMNS} FROM cves
         ORDER BY COALESCE(last_modified_at, last_seen_at) DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let cve = row_to_cve(row)?;
        out.push(serde_json::json!({
            "cve_id": cve.cve_id,
            "description": cve.description_text,
            "severity": cve.preferred_base_severity,
            "score": cve.preferred_base_score,
            "cvss_version": cve.preferred_cvss_version,
            "published_at": cve.published_at,
            "last_modified_at": cve.last_modified_at,
        }));
    }
    Ok(out)
}

pub async fn count_cves(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cves")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Admin purge: remove all CVE rows, changes, and links.
pub async fn delete_all_cves(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM cve_changes").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM cve_products").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM article_cves").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM event_cves").execute(&mut *tx).await?;
    let deleted = sqlx::query("DELETE FROM cves").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(deleted.rows_affected())
}
