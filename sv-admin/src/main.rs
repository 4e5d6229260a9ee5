//! sv-admin - Admin API process
//!
//! Serves the JSON command surface the operator UI consumes: jobs, sources,
//! runtime config, CVE sync, event maintenance, and dashboards. Shares the
//! database with the worker processes and nothing else.

mod api;
mod error;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;
use sv_common::db;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SV_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir =
        PathBuf::from(std::env::var("SV_DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
    let db_path = match std::env::var("SV_DATABASE_URL") {
        Ok(url) => PathBuf::from(url.trim_start_matches("sqlite:")),
        Err(_) => data_dir.join("sempervigil.db"),
    };
    let pool = db::init_pool(&db_path).await.context("database init failed")?;
    db::run_migrations(&pool).await.context("migrations failed")?;

    let admin_token = std::env::var("SV_ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
    if admin_token.is_none() {
        info!("SV_ADMIN_TOKEN not set; API is unauthenticated");
    }

    let state = AppState { pool, admin_token };
    let app = api::build_router(state).layer(TraceLayer::new_for_http());

    let bind = std::env::var("SV_ADMIN_BIND").unwrap_or_else(|_| "127.0.0.1:5880".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind failed: {bind}"))?;
    info!("Admin API listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
