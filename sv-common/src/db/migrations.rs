//! Database schema migrations
//!
//! Versioned, linear, idempotent. Each migration checks for its own effects
//! before applying them, so concurrent process startup and re-runs are safe.
//! Never modify an existing migration; add a new one.

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version. Increment when adding a migration.
const CURRENT_SCHEMA_VERSION: i32 = 3;

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?"
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Add a column if it is missing, tolerating a concurrent process adding it first.
async fn add_column(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    if column_exists(pool, table, column).await? {
        return Ok(());
    }
    match sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
        .execute(pool)
        .await
    {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
            info!("  {column} column added by concurrent process - skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    if !table_exists(pool, "schema_version").await? {
        return Ok(0);
    }
    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(version)
        .bind(crate::time::now_iso())
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT)",
    )
    .execute(pool)
    .await?;

    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }
    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({}); proceeding with caution",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }
    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }
    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
        info!("✓ Migration v3 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

/// Migration v1: core schema — sources, articles, CVEs, events, jobs.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: core schema");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            interval_minutes INTEGER NOT NULL DEFAULT 60,
            tags_json TEXT NOT NULL DEFAULT '[]',
            pause_until TEXT,
            paused_reason TEXT,
            user_agent TEXT,
            http_headers_json TEXT NOT NULL DEFAULT '{}',
            timeout_seconds INTEGER,
            allow_keywords_json TEXT NOT NULL DEFAULT '[]',
            deny_keywords_json TEXT NOT NULL DEFAULT '[]',
            min_interval_seconds INTEGER,
            html_item_selector TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS source_health (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            ok INTEGER NOT NULL,
            http_status INTEGER,
            found_count INTEGER NOT NULL DEFAULT 0,
            accepted_count INTEGER NOT NULL DEFAULT 0,
            seen_count INTEGER NOT NULL DEFAULT 0,
            filtered_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS health_alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            title TEXT NOT NULL,
            original_url TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            published_at TEXT,
            published_at_source TEXT,
            ingested_at TEXT NOT NULL,
            summary_text TEXT,
            content_text TEXT,
            content_html_excerpt TEXT,
            content_fetched_at TEXT,
            content_error TEXT,
            summary_llm TEXT,
            summary_model TEXT,
            summary_generated_at TEXT,
            summary_error TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            published_md_path TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS article_cves (
            article_id TEXT NOT NULL,
            cve_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            confidence_band TEXT NOT NULL,
            reasons_json TEXT NOT NULL DEFAULT '[]',
            evidence_json TEXT NOT NULL DEFAULT '{}',
            linked_at TEXT NOT NULL,
            PRIMARY KEY (article_id, cve_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cves (
            cve_id TEXT PRIMARY KEY,
            published_at TEXT,
            last_modified_at TEXT,
            last_seen_at TEXT NOT NULL,
            description_text TEXT,
            preferred_cvss_version TEXT NOT NULL DEFAULT 'none',
            preferred_base_score REAL,
            preferred_base_severity TEXT,
            preferred_vector TEXT,
            cvss_v31_json TEXT,
            cvss_v40_json TEXT,
            affected_products_json TEXT NOT NULL DEFAULT '[]',
            affected_cpes_json TEXT NOT NULL DEFAULT '[]',
            reference_domains_json TEXT NOT NULL DEFAULT '[]',
            raw_json TEXT,
            snapshot_hash TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cve_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cve_id TEXT NOT NULL,
            change_at TEXT NOT NULL,
            change_type TEXT NOT NULL,
            cvss_version TEXT,
            from_score REAL,
            to_score REAL,
            from_severity TEXT,
            to_severity TEXT,
            vector_from TEXT,
            vector_to TEXT,
            detail_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS vendors (
            vendor_norm TEXT PRIMARY KEY,
            display_name TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_key TEXT PRIMARY KEY,
            vendor_norm TEXT NOT NULL,
            product_norm TEXT NOT NULL,
            display_name TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cve_products (
            cve_id TEXT NOT NULL,
            product_key TEXT NOT NULL,
            versions_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (cve_id, product_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_key TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            severity TEXT,
            status TEXT NOT NULL DEFAULT 'proposed',
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            status_changed_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS event_cves (
            event_id TEXT NOT NULL,
            cve_id TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            confidence_band TEXT NOT NULL DEFAULT 'linked',
            reasons_json TEXT NOT NULL DEFAULT '[]',
            evidence_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (event_id, cve_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS event_products (
            event_id TEXT NOT NULL,
            product_key TEXT NOT NULL,
            PRIMARY KEY (event_id, product_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS event_articles (
            event_id TEXT NOT NULL,
            article_id TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            confidence_band TEXT NOT NULL DEFAULT 'linked',
            reasons_json TEXT NOT NULL DEFAULT '[]',
            evidence_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (event_id, article_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            requested_at TEXT NOT NULL,
            run_after TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            lease_owner TEXT,
            lease_expires_at TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            idempotency_key TEXT,
            result_json TEXT,
            error TEXT
        )
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_source_health_source_ts ON source_health(source_id, ts)",
        "CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_articles_ingested ON articles(ingested_at)",
        "CREATE INDEX IF NOT EXISTS idx_article_cves_cve ON article_cves(cve_id)",
        "CREATE INDEX IF NOT EXISTS idx_cve_changes_cve ON cve_changes(cve_id, change_at)",
        "CREATE INDEX IF NOT EXISTS idx_cve_products_product ON cve_products(product_key)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, job_type, priority, requested_at)",
        // At most one queued-or-running job per idempotency key, across all workers.
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idempotency
        ON jobs(idempotency_key)
        WHERE idempotency_key IS NOT NULL AND status IN ('queued', 'running')
        "#,
    ];
    for statement in indexes {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("  ✓ Core schema created");
    Ok(())
}

/// Migration v2: LLM registry — providers, models, prompts, profiles, routes, runs.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: LLM registry");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS llm_providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT,
            api_key_cipher TEXT,
            api_key_key_id TEXT,
            timeout_seconds INTEGER NOT NULL DEFAULT 60
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_models (
            id TEXT PRIMARY KEY,
            provider_id TEXT NOT NULL,
            model_name TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_prompts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            system_template TEXT NOT NULL,
            user_template TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            prompt_id TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_stage_routes (
            stage TEXT PRIMARY KEY,
            profile_id TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS llm_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts TEXT NOT NULL,
            profile_id TEXT,
            provider_id TEXT,
            model_id TEXT,
            prompt_name TEXT NOT NULL,
            input_chars INTEGER NOT NULL DEFAULT 0,
            output_chars INTEGER NOT NULL DEFAULT 0,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            ok INTEGER NOT NULL,
            error TEXT
        )
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("  ✓ LLM registry created");
    Ok(())
}

/// Migration v3: conditional-fetch validators and cross-source fingerprints.
///
/// Sources gain ETag/Last-Modified round-trip columns; articles gain an
/// author column and a content fingerprint for duplicate grouping.
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v3: cache validators + content fingerprints");

    if table_exists(pool, "sources").await? {
        add_column(pool, "sources", "etag", "TEXT").await?;
        add_column(pool, "sources", "last_modified", "TEXT").await?;
        add_column(pool, "sources", "last_fetch_at", "TEXT").await?;
    }
    if table_exists(pool, "articles").await? {
        add_column(pool, "articles", "author", "TEXT").await?;
        add_column(pool, "articles", "content_fingerprint", "TEXT").await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_fingerprint ON articles(content_fingerprint)",
        )
        .execute(pool)
        .await?;
    }

    info!("  ✓ Migration v3 complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::init_memory_pool;

    #[tokio::test]
    async fn migrations_from_empty() {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
        assert!(table_exists(&pool, "jobs").await.unwrap());
        assert!(table_exists(&pool, "articles").await.unwrap());
        assert!(table_exists(&pool, "llm_runs").await.unwrap());
        assert!(column_exists(&pool, "articles", "content_fingerprint")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn v3_upgrades_v2_database() {
        let pool = init_memory_pool().await.unwrap();
        // Simulate a database stopped at v2.
        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        migrate_v1(&pool).await.unwrap();
        migrate_v2(&pool).await.unwrap();
        set_schema_version(&pool, 2).await.unwrap();
        assert!(!column_exists(&pool, "sources", "etag").await.unwrap());

        run_migrations(&pool).await.unwrap();
        assert!(column_exists(&pool, "sources", "etag").await.unwrap());
        assert_eq!(get_schema_version(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn idempotency_index_enforced() {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, requested_at, run_after, idempotency_key)
             VALUES ('j1', 'events_rebuild', 'queued', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z', 'events_rebuild')",
        )
        .execute(&pool)
        .await
        .unwrap();
        let dup = sqlx::query(
            "INSERT INTO jobs (id, job_type, status, requested_at, run_after, idempotency_key)
             VALUES ('j2', 'events_rebuild', 'queued', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z', 'events_rebuild')",
        )
        .execute(&pool)
        .await;
        assert!(dup.is_err(), "partial unique index must reject the duplicate");
    }
}
