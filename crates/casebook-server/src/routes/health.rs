use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = match state.db.count_jobs_by_status().await {
        Ok(_) => "ok",
        Err(_) => "unavailable",
    };
    Json(json!({ "status": "ok", "database": database }))
}
