use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tracing::error;

use crate::webhook::{WebhookDecision, SIGNATURE_HEADER};

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/workitem", post(receive))
}

async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.webhooks.receive(&body, signature).await {
        Ok(WebhookDecision::Rejected) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "accepted": false })))
        }
        Ok(WebhookDecision::Malformed) => (StatusCode::OK, Json(json!({ "accepted": false }))),
        Ok(WebhookDecision::Ignored) => (StatusCode::OK, Json(json!({ "accepted": true }))),
        Ok(WebhookDecision::Enqueued { job_id, .. }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "job_id": job_id })),
        ),
        Err(e) => {
            error!("webhook could not be recorded: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "accepted": false, "error": e.to_string() })),
            )
        }
    }
}
