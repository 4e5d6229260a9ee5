//! Admin API routes
//!
//! Thin JSON endpoints over the worker's admin command layer. No templates,
//! no sessions; an optional bearer token (SV_ADMIN_TOKEN) gates every
//! /api route.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sv_common::models::Source;
use sv_worker::admin;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/cancel-all", post(cancel_all))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/sources", get(list_sources).post(upsert_source))
        .route("/sources/:id/test", post(test_source))
        .route("/sources/:id/unpause", post(unpause_source))
        .route("/config", get(get_config).patch(patch_config))
        .route("/cve/sync", post(cve_sync_now))
        .route("/events/rebuild", post(events_rebuild))
        .route("/events/purge", post(events_purge))
        .route("/content/:content_type/clear", post(clear_content))
        .route("/dashboard", get(dashboard))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

async fn require_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.admin_token {
        let supplied = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if supplied != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": { "kind": "validation", "message": "missing or invalid token" } })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    // Prove the database is reachable, not just that the process is up.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&state.pool)
        .await
        .map_err(|e| ApiError(e.into()))?;
    Ok(Json(json!({ "status": "ok", "schema_versions": count })))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Value>> {
    let jobs = admin::list_jobs(&state.pool, query.status.as_deref(), query.limit).await?;
    Ok(Json(json!({ "jobs": jobs })))
}

#[derive(Deserialize)]
struct EnqueueRequest {
    job_type: String,
    payload: Option<Value>,
    #[serde(default)]
    priority: i64,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<Json<Value>> {
    let result =
        admin::enqueue_job(&state.pool, &request.job_type, request.payload, request.priority)
            .await?;
    Ok(Json(json!(result)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = admin::get_job(&state.pool, &job_id).await?;
    Ok(Json(json!({ "job": job })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let canceled = admin::cancel_job(&state.pool, &job_id).await?;
    Ok(Json(json!({ "canceled": canceled })))
}

async fn cancel_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let result = admin::cancel_all(&state.pool).await?;
    Ok(Json(json!(result)))
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let statuses = admin::source_statuses(&state.pool).await?;
    Ok(Json(json!({ "sources": statuses })))
}

async fn upsert_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> ApiResult<Json<Value>> {
    admin::upsert_source(&state.pool, &source).await?;
    Ok(Json(json!({ "id": source.id })))
}

async fn test_source(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let result = admin::test_source(&state.pool, &source_id).await?;
    Ok(Json(result))
}

async fn unpause_source(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult<Json<Value>> {
    admin::unpause_source(&state.pool, &source_id).await?;
    Ok(Json(json!({ "id": source_id, "paused": false })))
}

async fn get_config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let config = admin::get_runtime_config(&state.pool).await?;
    Ok(Json(json!(config)))
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let updated = admin::patch_runtime_config(&state.pool, patch).await?;
    Ok(Json(json!(updated)))
}

#[derive(Deserialize, Default)]
struct CveSyncRequest {
    cve_id: Option<String>,
}

async fn cve_sync_now(
    State(state): State<AppState>,
    request: Option<Json<CveSyncRequest>>,
) -> ApiResult<Json<Value>> {
    let cve_id = request.and_then(|Json(r)| r.cve_id);
    let result = admin::run_cve_sync_now(&state.pool, cve_id.as_deref()).await?;
    Ok(Json(json!(result)))
}

async fn events_rebuild(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let result = admin::rebuild_events_now(&state.pool).await?;
    Ok(Json(json!(result)))
}

async fn events_purge(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let purged = admin::purge_events_now(&state.pool).await?;
    Ok(Json(json!({ "purged": purged })))
}

async fn clear_content(
    State(state): State<AppState>,
    Path(content_type): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = admin::clear_content(&state.pool, &content_type).await?;
    Ok(Json(json!({ "content_type": content_type, "deleted": deleted })))
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let dashboard = admin::dashboard(&state.pool).await?;
    Ok(Json(json!(dashboard)))
}
