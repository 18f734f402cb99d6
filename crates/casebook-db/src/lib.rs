#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDatabase;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use casebook_core::attachment::{Attachment, AttachmentRef, RegisterAttachment, Registration};
use casebook_core::sync_event::{NewSyncEvent, SeveritySummary, SyncEvent};
use casebook_core::sync_job::{
    EnqueueOutcome, JobFailure, JobStatus, JobStatusCount, NewSyncJob, SyncJob,
};
use casebook_core::upload_session::{SessionClaim, UploadSession};
use casebook_core::work_item_link::{CreateWorkItemLink, WorkItemLink};
use casebook_core::SyncError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(msg) => SyncError::NotFound(msg),
            DbError::Conflict(msg) => SyncError::Conflict(msg),
            DbError::Internal(msg) => SyncError::Internal(msg),
            DbError::Io(e) => SyncError::Storage(e.to_string()),
        }
    }
}

/// Relational store shared by every component of the sync engine.
///
/// Each method is its own transaction boundary. Every job state change
/// writes its audit event inside the same transaction.
#[async_trait]
pub trait Database: Send + Sync {
    // -- Attachment registry --

    /// Insert a row for `digest`, or return the existing one unchanged.
    async fn register_attachment(
        &self,
        input: &RegisterAttachment,
    ) -> Result<Registration, DbError>;
    async fn get_attachment(&self, id: &str) -> Result<Attachment, DbError>;
    async fn find_attachment_by_digest(&self, digest: &str)
        -> Result<Option<Attachment>, DbError>;
    async fn find_attachment_by_remote_id(
        &self,
        remote_attachment_id: &str,
    ) -> Result<Option<Attachment>, DbError>;
    /// Record the remote identity once an upload succeeded. The only
    /// mutation an attachment row ever sees.
    async fn set_remote_reference(
        &self,
        id: &str,
        remote_attachment_id: &str,
        remote_url: &str,
    ) -> Result<Attachment, DbError>;
    /// Fails with `Conflict` while links remain, unless `force` is set, in
    /// which case the links are deleted first.
    async fn delete_attachment(&self, id: &str, force: bool) -> Result<Attachment, DbError>;

    // -- Work item links --

    /// Idempotent: re-linking an existing pair only updates the comment.
    async fn link_attachment(&self, input: &CreateWorkItemLink) -> Result<WorkItemLink, DbError>;
    async fn get_link(&self, attachment_id: &str, work_item_id: i64)
        -> Result<WorkItemLink, DbError>;
    async fn list_links_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<AttachmentRef>, DbError>;
    async fn list_links_for_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Vec<WorkItemLink>, DbError>;

    // -- Sync job queue --

    async fn enqueue_job(&self, input: &NewSyncJob) -> Result<EnqueueOutcome, DbError>;
    /// Atomically claim the oldest due QUEUED job whose lock key has no
    /// IN_PROGRESS job, marking it IN_PROGRESS and counting the attempt.
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, DbError>;
    /// Finish a job. Fails with `Conflict` unless `worker_id` still holds
    /// its claim.
    async fn complete_job(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<SyncJob, DbError>;
    async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<SyncJob, DbError>;
    async fn get_job(&self, id: &str) -> Result<SyncJob, DbError>;
    async fn list_jobs_for_attachment(
        &self,
        attachment_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError>;
    async fn list_jobs_by_status(&self, status: JobStatus, limit: i64)
        -> Result<Vec<SyncJob>, DbError>;
    /// Delete a QUEUED job. Jobs in any other state are a `Conflict`.
    async fn cancel_job(&self, id: &str) -> Result<SyncJob, DbError>;
    /// Make every QUEUED job on `lock_key` due at `now`; returns them all.
    async fn reschedule_jobs(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError>;
    async fn find_stale_jobs(&self, claimed_before: DateTime<Utc>)
        -> Result<Vec<SyncJob>, DbError>;
    async fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>, DbError>;

    // -- Event log --

    async fn append_event(&self, event: &NewSyncEvent) -> Result<SyncEvent, DbError>;
    async fn list_events(&self, job_id: Option<&str>, limit: i64)
        -> Result<Vec<SyncEvent>, DbError>;
    async fn summarize_events(&self, since: DateTime<Utc>) -> Result<SeveritySummary, DbError>;

    // -- Upload sessions --

    async fn get_upload_session(&self, session_id: &str)
        -> Result<Option<UploadSession>, DbError>;
    /// Take ownership of a session id before any content is stored. A
    /// missing or expired row becomes a pending claim expiring at
    /// `now + pending_ttl`; a live row is returned untouched.
    async fn claim_upload_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> Result<SessionClaim, DbError>;
    /// Drop a pending claim after a failed upload. Resolved sessions are kept.
    async fn release_upload_session(&self, session_id: &str) -> Result<(), DbError>;
    /// Record the result of a session. A pending or expired row takes the new
    /// result; a live resolved one keeps its original (which is returned).
    async fn complete_upload_session(
        &self,
        session_id: &str,
        attachment_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UploadSession, DbError>;
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Sqlite,
    Postgres,
}

/// Configuration for selecting and connecting to a database backend.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub backend: DbBackend,
    pub database_url: Option<String>,
    pub sqlite_path: Option<String>,
}

impl DbConfig {
    /// Build from `CASEBOOK_DB_BACKEND`, `CASEBOOK_DATABASE_URL` and
    /// `CASEBOOK_SQLITE_PATH`. Defaults to SQLite.
    pub fn from_env() -> Self {
        let backend = match std::env::var("CASEBOOK_DB_BACKEND").as_deref() {
            Ok("postgres") | Ok("postgresql") => DbBackend::Postgres,
            _ => DbBackend::Sqlite,
        };
        Self {
            backend,
            database_url: std::env::var("CASEBOOK_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok(),
            sqlite_path: std::env::var("CASEBOOK_SQLITE_PATH").ok(),
        }
    }
}

/// Open the configured backend and run its migrations.
pub async fn open_database(config: &DbConfig) -> Result<Arc<dyn Database>, DbError> {
    match config.backend {
        DbBackend::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let db = SqliteDatabase::open(config)?;
                Ok(Arc::new(db))
            }
            #[cfg(not(feature = "sqlite"))]
            {
                Err(DbError::Internal(
                    "sqlite backend requested but the 'sqlite' feature is not enabled".into(),
                ))
            }
        }
        DbBackend::Postgres => {
            #[cfg(feature = "postgres")]
            {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    DbError::Internal("CASEBOOK_DATABASE_URL is required for postgres".into())
                })?;
                let db = postgres::PostgresDatabase::connect(url).await?;
                Ok(Arc::new(db))
            }
            #[cfg(not(feature = "postgres"))]
            {
                Err(DbError::Internal(
                    "postgres backend requested but the 'postgres' feature is not enabled".into(),
                ))
            }
        }
    }
}

/// Default data directory: `$XDG_DATA_HOME/casebook` or `~/.local/share/casebook`.
pub fn data_dir() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from(".")
    };
    base.join("casebook")
}
