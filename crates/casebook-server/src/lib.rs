pub mod auth;
pub mod config;
mod routes;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;
pub mod watchdog;
pub mod webhook;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use casebook_db::Database;
use casebook_service::{LocalSyncService, ServiceConfig};
use casebook_store::ContentStore;

use auth::AuthConfig;
use webhook::WebhookIngress;

pub use routes::{build_router, AppState, InnerAppState};

/// Settings that shape the HTTP surface.
#[derive(Clone, Default)]
pub struct AppSettings {
    pub webhook_secret: Option<String>,
    pub api_key: Option<String>,
    pub service: ServiceConfig,
}

/// Wire the service and webhook ingress to one database and content store.
/// Every enqueue signals `wake`.
pub fn build_state(
    db: Arc<dyn Database>,
    content: Arc<ContentStore>,
    settings: &AppSettings,
    wake: Arc<Notify>,
) -> AppState {
    let service = LocalSyncService::new(db.clone(), content)
        .with_config(settings.service.clone())
        .with_notify(wake.clone());
    let webhooks = WebhookIngress::new(
        db.clone(),
        settings.webhook_secret.clone(),
        settings.service.max_attempts,
        wake,
    );
    let auth = settings
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .map(|k| Arc::new(AuthConfig::from_key(k)));
    Arc::new(InnerAppState {
        service,
        db,
        webhooks,
        auth,
    })
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
