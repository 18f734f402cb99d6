//! Drives `AzureDevOpsTracker` against an in-process axum server that mimics
//! the work-item tracking endpoints it uses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes as BodyBytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};

use casebook_remote::{AzureDevOpsTracker, RemoteConfig, RemoteError, RemoteTracker};

const PAT_HEADER: &str = "Basic OnBhdA==";

#[derive(Default)]
struct Fake {
    base_url: String,
    uploads: Vec<(String, Vec<u8>)>,
    patches: Vec<(i64, Value)>,
    relations: HashMap<i64, Vec<Value>>,
}

type Shared = Arc<Mutex<Fake>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == PAT_HEADER)
}

async fn upload(
    State(fake): State<Shared>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
    body: BodyBytes,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if q.get("api-version").map(String::as_str) != Some("7.1") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let name = q.get("fileName").cloned().ok_or(StatusCode::BAD_REQUEST)?;
    let mut fake = fake.lock().unwrap();
    fake.uploads.push((name, body.to_vec()));
    let id = format!("0000000{}-aaaa-bbbb-cccc-dddddddddddd", fake.uploads.len());
    let url = format!("{}/contoso/web/_apis/wit/attachments/{id}", fake.base_url);
    Ok(Json(json!({ "id": id, "url": url })))
}

async fn get_work_item(
    State(fake): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if q.get("$expand").map(String::as_str) != Some("relations") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let fake = fake.lock().unwrap();
    match fake.relations.get(&id) {
        Some(rels) => Ok(Json(json!({ "id": id, "rev": 3, "relations": rels }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn patch_work_item(
    State(fake): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    body: BodyBytes,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json-patch+json" {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
    let ops: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    fake.lock().unwrap().patches.push((id, ops));
    Ok(Json(json!({ "id": id })))
}

async fn download(
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Vec<u8>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if q.get("download").map(String::as_str) != Some("true") {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(format!("content of {id}").into_bytes())
}

async fn delete_attachment(Path(id): Path<String>) -> StatusCode {
    if id.starts_with("missing") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn spawn_fake() -> (Shared, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let fake: Shared = Arc::new(Mutex::new(Fake {
        base_url: base_url.clone(),
        ..Default::default()
    }));

    let app = Router::new()
        .route("/contoso/web/_apis/wit/attachments", post(upload))
        .route(
            "/contoso/web/_apis/wit/attachments/{id}",
            get(download).delete(delete_attachment),
        )
        .route(
            "/contoso/web/_apis/wit/workitems/{id}",
            get(get_work_item).patch(patch_work_item),
        )
        .with_state(fake.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (fake, base_url)
}

fn tracker(base_url: &str, pat: &str) -> AzureDevOpsTracker {
    AzureDevOpsTracker::new(&RemoteConfig {
        org_url: format!("{base_url}/contoso"),
        project: "web".into(),
        pat: pat.into(),
        api_version: "7.1".into(),
    })
    .unwrap()
}

#[tokio::test]
async fn upload_sends_octet_stream_with_file_name() {
    let (fake, base_url) = spawn_fake().await;
    let tracker = tracker(&base_url, "pat");

    let uploaded = tracker
        .upload_attachment("login failure.png", Bytes::from_static(b"\x89PNG"))
        .await
        .unwrap();

    assert!(uploaded.url.ends_with(&uploaded.id));
    let fake = fake.lock().unwrap();
    assert_eq!(fake.uploads.len(), 1);
    assert_eq!(fake.uploads[0].0, "login failure.png");
    assert_eq!(fake.uploads[0].1, b"\x89PNG");
}

#[tokio::test]
async fn bad_pat_is_auth_error() {
    let (_fake, base_url) = spawn_fake().await;
    let tracker = tracker(&base_url, "wrong");

    let err = tracker
        .upload_attachment("a.txt", Bytes::from_static(b"a"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Auth(_)), "got {err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn link_patches_only_when_relation_missing() {
    let (fake, base_url) = spawn_fake().await;
    let existing = format!("{base_url}/contoso/web/_apis/wit/attachments/EXISTING-1");
    fake.lock().unwrap().relations.insert(
        42,
        vec![
            json!({ "rel": "System.LinkTypes.Hierarchy-Reverse", "url": "https://x/parent" }),
            json!({
                "rel": "AttachedFile",
                "url": existing,
                "attributes": { "name": "log.txt", "resourceSize": 12, "comment": "old" }
            }),
        ],
    );
    let tracker = tracker(&base_url, "pat");

    let listed = tracker.list_attachments(42).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name.as_deref(), Some("log.txt"));
    assert_eq!(listed[0].size_bytes, Some(12));

    let already = format!("{base_url}/contoso/web/_apis/wit/attachments/existing-1?fileName=log.txt");
    assert!(!tracker.link_attachment(42, &already, "dup").await.unwrap());
    assert!(fake.lock().unwrap().patches.is_empty());

    let fresh = format!("{base_url}/contoso/web/_apis/wit/attachments/new-2");
    assert!(tracker.link_attachment(42, &fresh, "step 4").await.unwrap());

    let fake = fake.lock().unwrap();
    assert_eq!(fake.patches.len(), 1);
    let (id, ops) = &fake.patches[0];
    assert_eq!(*id, 42);
    assert_eq!(ops[0]["op"], "add");
    assert_eq!(ops[0]["path"], "/relations/-");
    assert_eq!(ops[0]["value"]["rel"], "AttachedFile");
    assert_eq!(ops[0]["value"]["url"], fresh.as_str());
    assert_eq!(ops[0]["value"]["attributes"]["comment"], "step 4");
}

#[tokio::test]
async fn unlink_removes_by_full_relation_index() {
    let (fake, base_url) = spawn_fake().await;
    let target = format!("{base_url}/contoso/web/_apis/wit/attachments/target-9");
    fake.lock().unwrap().relations.insert(
        7,
        vec![
            json!({ "rel": "System.LinkTypes.Related", "url": "https://x/1" }),
            json!({ "rel": "AttachedFile", "url": format!("{base_url}/contoso/web/_apis/wit/attachments/other") }),
            json!({ "rel": "AttachedFile", "url": target }),
        ],
    );
    let tracker = tracker(&base_url, "pat");

    assert!(tracker.unlink_attachment(7, &target).await.unwrap());
    assert!(!tracker
        .unlink_attachment(7, &format!("{base_url}/contoso/web/_apis/wit/attachments/absent"))
        .await
        .unwrap());
    // Unknown work item: nothing to remove.
    assert!(!tracker.unlink_attachment(999, &target).await.unwrap());

    let fake = fake.lock().unwrap();
    assert_eq!(fake.patches.len(), 1);
    assert_eq!(fake.patches[0].1[0]["op"], "remove");
    assert_eq!(fake.patches[0].1[0]["path"], "/relations/2");
}

#[tokio::test]
async fn download_and_delete() {
    let (_fake, base_url) = spawn_fake().await;
    let tracker = tracker(&base_url, "pat");

    let url = format!("{base_url}/contoso/web/_apis/wit/attachments/abc?fileName=a.txt");
    let data = tracker.download_attachment(&url).await.unwrap();
    assert_eq!(data.as_ref(), b"content of abc");

    tracker.delete_attachment("abc").await.unwrap();
    // 404 on delete counts as already gone.
    tracker.delete_attachment("missing-1").await.unwrap();
}

#[tokio::test]
async fn missing_work_item_is_not_found() {
    let (_fake, base_url) = spawn_fake().await;
    let tracker = tracker(&base_url, "pat");

    let err = tracker.list_attachments(404).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
}
