use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use casebook_db::Database;
use casebook_store::{ContentStore, LocalStore, ObjectStore, StoreConfig};

use crate::{build_router, build_state, AppSettings, AppState};

pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Everything behind a test router, so tests can inspect or drive it.
pub struct TestApp {
    pub state: AppState,
    pub db: Arc<dyn Database>,
    pub content: Arc<ContentStore>,
    pub wake: Arc<Notify>,
}

fn test_app(api_key: Option<String>) -> TestApp {
    let db: Arc<dyn Database> = Arc::new(casebook_db::SqliteDatabase::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap().keep();
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(&StoreConfig::local(
        dir.to_string_lossy(),
    )));
    let content = Arc::new(ContentStore::new(objects));
    let wake = Arc::new(Notify::new());
    let settings = AppSettings {
        webhook_secret: Some(TEST_WEBHOOK_SECRET.into()),
        api_key,
        ..Default::default()
    };
    let state = build_state(db.clone(), content.clone(), &settings, wake.clone());
    TestApp {
        state,
        db,
        content,
        wake,
    }
}

/// Build a test router with in-memory SQLite, temp local store, no auth.
pub async fn test_router() -> Router {
    build_router(test_app(None).state)
}

/// Build a test router with auth enabled, returning (router, api_key).
pub async fn test_router_with_auth() -> (Router, String) {
    let api_key = crate::auth::generate_api_key();
    let app = test_app(Some(api_key.clone()));
    (build_router(app.state), api_key)
}

/// A running test server with base_url and background task handle.
pub struct TestServer {
    pub base_url: String,
    pub db: Arc<dyn Database>,
    pub content: Arc<ContentStore>,
    _handle: tokio::task::JoinHandle<()>,
}

/// Spawn an axum test server on a random port. No workers run; tests drive
/// the queue themselves through `db`.
pub async fn spawn_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");
    let app = test_app(None);
    let router = build_router(app.state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestServer {
        base_url,
        db: app.db,
        content: app.content,
        _handle: handle,
    }
}
