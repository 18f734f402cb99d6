pub mod health;
pub mod jobs;
pub mod sync;
pub mod webhooks;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use casebook_db::Database;
use casebook_service::{LocalSyncService, ServiceError};

use crate::auth::{auth_middleware, AuthConfig};
use crate::webhook::WebhookIngress;

/// Upper bound on request bodies; uploads arrive base64-encoded in JSON.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct InnerAppState {
    pub service: LocalSyncService,
    pub db: Arc<dyn Database>,
    pub webhooks: WebhookIngress,
    pub auth: Option<Arc<AuthConfig>>,
}

pub type AppState = Arc<InnerAppState>;

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .merge(health::routes())
        .merge(webhooks::routes());

    let protected = Router::new()
        .merge(sync::routes())
        .merge(jobs::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    public
        .merge(protected)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn to_error(e: ServiceError) -> ApiError {
    let status = match &e {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Auth(_) => StatusCode::UNAUTHORIZED,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::RemoteApi(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Storage(_) | ServiceError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!("request failed: {e}");
    }
    (status, Json(json!({ "error": e.to_string() })))
}

pub(crate) fn bad_request(msg: impl Into<String>) -> ApiError {
    to_error(ServiceError::Validation(msg.into()))
}
