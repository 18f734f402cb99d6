use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use casebook_service::{
    DeleteOptions, JobResponse, JobsResponse, LinkRequest, SyncService, UploadRequest,
};

use super::{bad_request, to_error, ApiError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/upload", post(upload))
        .route("/sync/link-attachment", post(link_attachment))
        // GET takes a work item id, DELETE an attachment id.
        .route(
            "/sync/attachments/{id}",
            get(list_attachments).delete(delete_attachment),
        )
        .route("/sync/attachments/{id}/content", get(attachment_content))
        .route("/sync/force-sync/{attachment_id}", post(force_sync))
        .route("/sync/status/{attachment_id}", get(status))
        .route("/sync/download/{attachment_id}", post(download))
        .route("/sync/deduplication/{digest}", get(deduplication))
        .route("/sync/upload-session/{session_id}", get(upload_session))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| bad_request(format!("malformed request body: {}", e.body_text())))
}

async fn upload(
    State(state): State<AppState>,
    body: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let input = json_body(body)?;
    state
        .service
        .upload(&input)
        .await
        .map(|r| (StatusCode::CREATED, Json(json!(r))))
        .map_err(to_error)
}

async fn link_attachment(
    State(state): State<AppState>,
    body: Result<Json<LinkRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(body)?;
    state
        .service
        .link_attachment(&input)
        .await
        .map(|r| Json(json!(r)))
        .map_err(to_error)
}

async fn list_attachments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let work_item_id: i64 = id
        .parse()
        .map_err(|_| bad_request(format!("work item id must be an integer, got {id:?}")))?;
    state
        .service
        .list_attachments(work_item_id)
        .await
        .map(|refs| Json(json!(refs)))
        .map_err(to_error)
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    delete_remote: bool,
}

async fn delete_attachment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let options = DeleteOptions {
        force: q.force,
        delete_remote: q.delete_remote,
    };
    state
        .service
        .delete_attachment(&id, &options)
        .await
        .map(|job| (StatusCode::ACCEPTED, Json(JobResponse { job })))
        .map_err(to_error)
}

async fn attachment_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let content = state
        .service
        .get_attachment_content(&id)
        .await
        .map_err(to_error)?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content.attachment.mime_type.as_str())
        .header(header::CONTENT_LENGTH, content.data.len())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&content.attachment.file_name),
        )
        .body(Body::from(content.data))
        .map_err(|e| to_error(casebook_service::ServiceError::Internal(e.to_string())))
}

/// Strips everything that cannot appear inside a quoted header value.
fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn force_sync(
    State(state): State<AppState>,
    Path(attachment_id): Path<String>,
) -> Result<(StatusCode, Json<JobsResponse>), ApiError> {
    state
        .service
        .force_sync(&attachment_id)
        .await
        .map(|jobs| (StatusCode::ACCEPTED, Json(JobsResponse { jobs })))
        .map_err(to_error)
}

async fn status(
    State(state): State<AppState>,
    Path(attachment_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .get_status(&attachment_id)
        .await
        .map(|s| Json(json!(s)))
        .map_err(to_error)
}

async fn download(
    State(state): State<AppState>,
    Path(attachment_id): Path<String>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    state
        .service
        .request_download(&attachment_id)
        .await
        .map(|job| (StatusCode::ACCEPTED, Json(JobResponse { job })))
        .map_err(to_error)
}

async fn deduplication(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .check_duplicate(&digest)
        .await
        .map(|d| Json(json!(d)))
        .map_err(to_error)
}

async fn upload_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .resolve_upload_session(&session_id)
        .await
        .map(|s| Json(json!(s)))
        .map_err(to_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn content_disposition_is_always_a_valid_header() {
        for name in ["report.pdf", "a\nb.txt", "q\"uote\\d.txt", "nul\0.bin", "résumé.pdf"] {
            let value = content_disposition(name);
            assert!(HeaderValue::from_bytes(value.as_bytes()).is_ok(), "{value:?}");
        }
        assert_eq!(content_disposition("a\r\nb.txt"), "attachment; filename=\"ab.txt\"");
        assert_eq!(content_disposition("q\"uote.txt"), "attachment; filename=\"quote.txt\"");
    }
}
