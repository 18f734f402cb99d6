use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

use casebook_db::{open_database, DbConfig};
use casebook_remote::{create_tracker, RemoteConfig};
use casebook_store::{create_store, ContentStore, StoreConfig};
use casebook_worker::{spawn_pool, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::parse();
    info!("casebook-worker starting");

    let db = open_database(&DbConfig::from_env())
        .await
        .context("open database")?;
    let objects = create_store(&StoreConfig::from_env()).context("open content store")?;
    let content = Arc::new(ContentStore::new(objects));

    let remote_config = RemoteConfig::from_env().context(
        "CASEBOOK_ADO_ORG_URL, CASEBOOK_ADO_PROJECT and CASEBOOK_ADO_PAT must be set",
    )?;
    info!(org = %remote_config.org_url, project = %remote_config.project, "remote tracker");
    let remote = create_tracker(&remote_config).context("create remote tracker")?;

    let executor = Arc::new(JobExecutor::new(db.clone(), content, remote));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_pool(
        &config.worker_prefix(),
        db,
        executor,
        &config.options,
        Arc::new(Notify::new()),
        shutdown_rx,
    );
    info!(
        "{} worker(s) polling every {}s",
        handles.len(),
        config.options.poll_interval().as_secs()
    );

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port).await {
            error!("health server failed: {e}");
        }
    });
    info!("health endpoint: http://127.0.0.1:{health_port}/health");

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutting down; waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_health_server(port: u16) -> Result<()> {
    let app = Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "ok", "role": "worker"})) }),
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
