use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use casebook_service::SyncService;

use super::{to_error, ApiError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/sync/dead-jobs", get(dead_jobs))
        .route("/sync/summary", get(summary))
        .route("/sync/events", get(events))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .get_job(&id)
        .await
        .map(|j| Json(json!(j)))
        .map_err(to_error)
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .cancel_job(&id)
        .await
        .map(|j| Json(json!(j)))
        .map_err(to_error)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn dead_jobs(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .list_dead_jobs(q.limit.unwrap_or(100))
        .await
        .map(|jobs| Json(json!(jobs)))
        .map_err(to_error)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    window_secs: Option<i64>,
}

async fn summary(
    State(state): State<AppState>,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .summary(q.window_secs.unwrap_or(3600))
        .await
        .map(|s| Json(json!(s)))
        .map_err(to_error)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    job_id: Option<String>,
    limit: Option<i64>,
}

async fn events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .list_events(q.job_id.as_deref(), q.limit.unwrap_or(100))
        .await
        .map(|e| Json(json!(e)))
        .map_err(to_error)
}
