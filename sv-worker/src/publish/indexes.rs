//! JSON search indexes
//!
//! `articles.json`, `cves.json`, and `events.json` under `static/index/`
//! carry the minimum fields the site's client-side search needs. Writes are
//! atomic (write-to-temp + rename) so a concurrent reader sees either the
//! old file or the new one, never a torn file.

use serde_json::Value;
use sqlx::SqlitePool;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use sv_common::{Error, Result};
use tracing::info;

use crate::db::{articles, cves, events};

const INDEX_LIMIT: i64 = 5000;

/// Atomically write a JSON value to `path`.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("index path has no parent: {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, value)
        .map_err(|e| Error::Internal(format!("index serialization failed: {e}")))?;
    temp.write_all(b"\n")?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|e| Error::Internal(format!("index rename failed: {e}")))?;
    Ok(())
}

fn index_dir(site_src_dir: &Path) -> PathBuf {
    site_src_dir.join("static").join("index")
}

pub async fn write_articles_index(pool: &SqlitePool, site_src_dir: &Path) -> Result<PathBuf> {
    let rows = articles::list_articles_for_index(pool, INDEX_LIMIT).await?;
    let path = index_dir(site_src_dir).join("articles.json");
    write_json_atomic(&path, &Value::Array(rows))?;
    Ok(path)
}

pub async fn write_cves_index(pool: &SqlitePool, site_src_dir: &Path) -> Result<PathBuf> {
    let rows = cves::list_cves_for_index(pool, INDEX_LIMIT).await?;
    let path = index_dir(site_src_dir).join("cves.json");
    write_json_atomic(&path, &Value::Array(rows))?;
    Ok(path)
}

pub async fn write_events_index(pool: &SqlitePool, site_src_dir: &Path) -> Result<PathBuf> {
    let all = events::list_events(pool).await?;
    let mut rows = Vec::with_capacity(all.len());
    for event in &all {
        let cve_ids = events::list_event_cve_ids(pool, &event.id).await?;
        let product_keys = events::list_event_product_keys(pool, &event.id).await?;
        let article_ids = events::list_event_article_ids(pool, &event.id).await?;
        rows.push(serde_json::json!({
            "event_id": event.id,
            "event_key": event.event_key,
            "title": event.title,
            "summary": event.summary,
            "severity": event.severity,
            "kind": event.kind.as_str(),
            "status": event.status.as_str(),
            "first_seen_at": event.first_seen_at,
            "last_seen_at": event.last_seen_at,
            "cves": cve_ids.iter().take(50).collect::<Vec<_>>(),
            "products": product_keys.iter().take(50).collect::<Vec<_>>(),
            "counts": {
                "cves": cve_ids.len(),
                "products": product_keys.len(),
                "articles": article_ids.len(),
            },
        }));
    }
    let path = index_dir(site_src_dir).join("events.json");
    write_json_atomic(&path, &Value::Array(rows))?;
    Ok(path)
}

/// Refresh all three indexes.
pub async fn write_all_indexes(pool: &SqlitePool, site_src_dir: &Path) -> Result<()> {
    let articles_path = write_articles_index(pool, site_src_dir).await?;
    let cves_path = write_cves_index(pool, site_src_dir).await?;
    let events_path = write_events_index(pool, site_src_dir).await?;
    info!(
        articles = %articles_path.display(),
        cves = %cves_path.display(),
        events = %events_path.display(),
        "search indexes written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index").join("articles.json");
        write_json_atomic(&path, &json!([{"id": 1}])).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed[0]["id"], 1);
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.json");
        write_json_atomic(&path, &json!([1, 2, 3])).unwrap();
        write_json_atomic(&path, &json!([4])).unwrap();
        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, json!([4]));
    }
}
