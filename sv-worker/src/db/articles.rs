//! Article persistence
//!
//! Articles are content-addressed (`sha256(canonical_url + source_id)`), so
//! inserts ignore duplicates and every pipeline stage mutates its own columns
//! on the one canonical row.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use sv_common::models::{Article, LinkMeta};
use sv_common::time::now_iso;
use sv_common::Result;

const ARTICLE_COLUMNS: &str = "id, source_id, title, original_url, canonical_url, published_at, \
     published_at_source, ingested_at, author, summary_text, content_text, content_html_excerpt, \
     content_fetched_at, content_error, summary_llm, summary_model, summary_generated_at, \
     summary_error, tags_json, content_fingerprint, published_md_path";

fn row_to_article(row: &SqliteRow) -> Result<Article> {
    let tags_json: String = row.try_get("tags_json")?;
    Ok(Article {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        original_url: row.try_get("original_url")?,
        canonical_url: row.try_get("canonical_url")?,
        published_at: row.try_get("published_at")?,
        published_at_source: row.try_get("published_at_source")?,
        ingested_at: row.try_get("ingested_at")?,
        author: row.try_get("author")?,
        summary_text: row.try_get("summary_text")?,
        content_text: row.try_get("content_text")?,
        content_html_excerpt: row.try_get("content_html_excerpt")?,
        content_fetched_at: row.try_get("content_fetched_at")?,
        content_error: row.try_get("content_error")?,
        summary_llm: row.try_get("summary_llm")?,
        summary_model: row.try_get("summary_model")?,
        summary_generated_at: row.try_get("summary_generated_at")?,
        summary_error: row.try_get("summary_error")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        content_fingerprint: row.try_get("content_fingerprint")?,
        published_md_path: row.try_get("published_md_path")?,
    })
}

pub async fn article_exists(pool: &SqlitePool, article_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM articles WHERE id = ? LIMIT 1")
        .bind(article_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn get_article(pool: &SqlitePool, article_id: &str) -> Result<Option<Article>> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(article_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_article(&r)).transpose()
}

/// Insert articles, ignoring ones already present. Returns how many were new.
pub async fn insert_articles(pool: &SqlitePool, articles: &[Article]) -> Result<usize> {
    if articles.is_empty() {
        return Ok(0);
    }
    let mut inserted = 0;
    let mut tx = pool.begin().await?;
    for article in articles {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO articles
                (id, source_id, title, original_url, canonical_url, published_at,
                 published_at_source, ingested_at, author, summary_text, tags_json,
                 content_fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.id)
        .bind(&article.source_id)
        .bind(&article.title)
        .bind(&article.original_url)
        .bind(&article.canonical_url)
        .bind(&article.published_at)
        .bind(&article.published_at_source)
        .bind(&article.ingested_at)
        .bind(&article.author)
        .bind(&article.summary_text)
        .bind(serde_json::to_string(&article.tags).unwrap_or_else(|_| "[]".into()))
        .bind(&article.content_fingerprint)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected() as usize;
    }
    tx.commit().await?;
    Ok(inserted)
}

/// Record the outcome of the content-fetch stage.
pub async fn update_article_content(
    pool: &SqlitePool,
    article_id: &str,
    content_text: Option<&str>,
    content_html_excerpt: Option<&str>,
    content_error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE articles SET content_text = ?, content_html_excerpt = ?,
                             content_fetched_at = ?, content_error = ?
         WHERE id = ?",
    )
    .bind(content_text)
    .bind(content_html_excerpt)
    .bind(now_iso())
    .bind(content_error)
    .bind(article_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the outcome of the summarize stage.
pub async fn update_article_summary(
    pool: &SqlitePool,
    article_id: &str,
    summary_llm: Option<&str>,
    summary_model: Option<&str>,
    summary_error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE articles SET summary_llm = ?, summary_model = ?,
                             summary_generated_at = ?, summary_error = ?
         WHERE id = ?",
    )
    .bind(summary_llm)
    .bind(summary_model)
    .bind(now_iso())
    .bind(summary_error)
    .bind(article_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_published_md_path(
    pool: &SqlitePool,
    article_id: &str,
    path: &str,
) -> Result<()> {
    sqlx::query("UPDATE articles SET published_md_path = ? WHERE id = ?")
        .bind(path)
        .bind(article_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Link an article to extracted CVEs. The `(article_id, cve_id)` primary key
/// makes re-runs idempotent; a re-link refreshes confidence and evidence.
pub async fn upsert_article_cve_links(
    pool: &SqlitePool,
    article_id: &str,
    cve_ids: &[String],
    meta: &LinkMeta,
) -> Result<usize> {
    if cve_ids.is_empty() {
        return Ok(0);
    }
    let now = now_iso();
    let reasons_json = serde_json::to_string(&meta.reasons).unwrap_or_else(|_| "[]".into());
    let evidence_json = serde_json::to_string(&meta.evidence).unwrap_or_else(|_| "{}".into());
    let mut tx = pool.begin().await?;
    for cve_id in cve_ids {
        sqlx::query(
            r#"
            INSERT INTO article_cves (article_id, cve_id, confidence, confidence_band,
                                      reasons_json, evidence_json, linked_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(article_id, cve_id) DO UPDATE SET
                confidence = excluded.confidence,
                confidence_band = excluded.confidence_band,
                reasons_json = excluded.reasons_json,
                evidence_json = excluded.evidence_json
            "#,
        )
        .bind(article_id)
        .bind(cve_id)
        .bind(meta.confidence)
        .bind(&meta.confidence_band)
        .bind(&reasons_json)
        .bind(&evidence_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(cve_ids.len())
}

/// All article→CVE links, joined with the article's timeline fields.
pub async fn list_article_cve_links(
    pool: &SqlitePool,
) -> Result<Vec<(String, String, f64, String, String, String, Option<String>, String)>> {
    let rows: Vec<(String, String, f64, String, String, String, Option<String>, String)> =
        sqlx::query_as(
            r#"
            SELECT ac.article_id, ac.cve_id, ac.confidence, ac.confidence_band,
                   ac.reasons_json, ac.evidence_json, a.published_at, a.ingested_at
            FROM article_cves ac
            JOIN articles a ON a.id = ac.article_id
            ORDER BY ac.article_id, ac.cve_id
            "#,
        )
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn list_cve_ids_for_article(pool: &SqlitePool, article_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT cve_id FROM article_cves WHERE article_id = ? ORDER BY cve_id")
            .bind(article_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Minimal article rows for the JSON search index, newest first.
pub async fn list_articles_for_index(pool: &SqlitePool, limit: i64) -> Result<Vec<Value>> {
    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles
         ORDER BY COALESCE(published_at, ingested_at) DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let article = row_to_article(row)?;
        out.push(serde_json::json!({
            "id": article.id,
            "title": article.title,
            "url": article.canonical_url,
            "source_id": article.source_id,
            "published_at": article.published_at,
            "ingested_at": article.ingested_at,
            "tags": article.tags,
            "summary": article.summary_text,
        }));
    }
    Ok(out)
}

pub async fn count_articles(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Admin purge: remove all articles and their CVE/event links.
pub async fn delete_all_articles(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM article_cves").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM event_articles").execute(&mut *tx).await?;
    let deleted = sqlx::query("DELETE FROM articles").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(deleted.rows_affected())
}
