use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use casebook_db::{open_database, Database, DbConfig};
use casebook_remote::{create_tracker, RemoteConfig};
use casebook_service::{LocalSyncService, SyncService};
use casebook_store::{create_store, ContentStore, StoreConfig};
use casebook_worker::{spawn_pool, JobExecutor};

use casebook_server::config::{Command, ServerConfig};
use casebook_server::{auth, build_state, watchdog, AppSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();

    if let Some(Command::Keygen) = config.command {
        println!("{}", auth::generate_api_key());
        eprintln!("\nSet it as CASEBOOK_API_KEY on the server and its clients.");
        return Ok(());
    }

    let db = open_database(&DbConfig::from_env())
        .await
        .context("open database")?;
    let objects = create_store(&StoreConfig::from_env()).context("open content store")?;
    let content = Arc::new(ContentStore::new(objects));

    match config.command.clone() {
        Some(Command::DeadJobs { limit }) => {
            let service = LocalSyncService::new(db, content);
            let jobs = service.list_dead_jobs(limit).await?;
            if jobs.is_empty() {
                eprintln!("No dead jobs.");
            } else {
                println!("{:<38} {:<10} {:<52} {:<8} LAST ERROR", "ID", "TYPE", "TARGET", "TRIES");
                for job in jobs {
                    println!(
                        "{:<38} {:<10} {:<52} {:<8} {}",
                        job.id,
                        job.job_type,
                        job.target_key,
                        format!("{}/{}", job.attempts, job.max_attempts),
                        job.last_error.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        Some(Command::CancelJob { id }) => {
            let service = LocalSyncService::new(db, content);
            let job = service.cancel_job(&id).await?;
            eprintln!("Cancelled {} job {} ({})", job.job_type, job.id, job.target_key);
        }
        Some(Command::Summary { window_secs }) => {
            let service = LocalSyncService::new(db, content);
            let summary = service.summary(window_secs).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Some(Command::Keygen) | None => run_server(config, db, content).await?,
    }

    Ok(())
}

async fn run_server(
    config: ServerConfig,
    db: Arc<dyn Database>,
    content: Arc<ContentStore>,
) -> Result<()> {
    let settings = AppSettings {
        webhook_secret: config.webhook_secret.clone(),
        api_key: config.api_key.clone(),
        service: config.service_config(),
    };
    if settings.webhook_secret.is_none() {
        warn!("CASEBOOK_WEBHOOK_SECRET is not set; all webhooks will be rejected");
    }
    if settings.api_key.is_some() {
        info!("authentication enabled");
    } else {
        info!("authentication disabled (no CASEBOOK_API_KEY)");
    }

    let wake = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = match RemoteConfig::from_env() {
        Some(remote_config) => {
            info!(org = %remote_config.org_url, project = %remote_config.project, "remote tracker");
            let remote = create_tracker(&remote_config).context("create remote tracker")?;
            let executor = Arc::new(JobExecutor::new(db.clone(), content.clone(), remote));
            spawn_pool(
                &config.worker_id,
                db.clone(),
                executor,
                &config.worker,
                wake.clone(),
                shutdown_rx,
            )
        }
        None => {
            warn!("remote tracker not configured; jobs will queue but not run");
            Vec::new()
        }
    };

    tokio::spawn(watchdog::run_watchdog(
        db.clone(),
        config.worker.stale_after(),
        config.watchdog_interval(),
        wake.clone(),
    ));

    let state = build_state(db, content, &settings, wake);
    let addr = config.addr();
    let listener = TcpListener::bind(addr).await?;
    info!("casebook-server listening on http://{addr} ({} worker(s))", workers.len());

    casebook_server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("shutting down; waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }
    Ok(())
}
