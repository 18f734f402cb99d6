pub(crate) mod migrations;
pub mod queries;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use casebook_core::attachment::{Attachment, AttachmentRef, RegisterAttachment, Registration};
use casebook_core::sync_event::{NewSyncEvent, SeveritySummary, SyncEvent};
use casebook_core::sync_job::{
    EnqueueOutcome, JobFailure, JobStatus, JobStatusCount, NewSyncJob, SyncJob,
};
use casebook_core::upload_session::{SessionClaim, UploadSession};
use casebook_core::work_item_link::{CreateWorkItemLink, WorkItemLink};

use crate::{Database, DbConfig, DbError};

/// Extension trait that converts `rusqlite::Result<T>` into `Result<T, DbError>`.
pub(crate) trait SqliteResultExt<T> {
    fn to_db(self) -> Result<T, DbError>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn to_db(self) -> Result<T, DbError> {
        self.map_err(map_sqlite_err)
    }
}

#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(config: &DbConfig) -> Result<Self, DbError> {
        let path = config
            .sqlite_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| crate::data_dir().join("casebook.db"));
        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path).to_db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().to_db()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").to_db()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DbError::Internal("lock poisoned".into()))?;
        f(&conn)
    }

    fn run_migrations(&self) -> Result<(), DbError> {
        self.with_conn(migrations::run)
    }

    /// Run a synchronous query function on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&SqliteDatabase) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))?
    }
}

/// Map a `rusqlite::Error` into a `DbError::Internal`.
pub(crate) fn map_sqlite_err(e: rusqlite::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Map `QueryReturnedNoRows` to `NotFound(entity)`, everything else to `Internal`.
pub(crate) fn not_found_or(entity: String) -> impl FnOnce(rusqlite::Error) -> DbError {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(entity),
        other => DbError::Internal(other.to_string()),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // -- Attachment registry --
    async fn register_attachment(
        &self,
        input: &RegisterAttachment,
    ) -> Result<Registration, DbError> {
        let input = input.clone();
        self.blocking(move |db| db.register_attachment_sync(&input))
            .await
    }
    async fn get_attachment(&self, id: &str) -> Result<Attachment, DbError> {
        let id = id.to_string();
        self.blocking(move |db| db.get_attachment_sync(&id)).await
    }
    async fn find_attachment_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<Attachment>, DbError> {
        let digest = digest.to_string();
        self.blocking(move |db| db.find_attachment_by_digest_sync(&digest))
            .await
    }
    async fn find_attachment_by_remote_id(
        &self,
        remote_attachment_id: &str,
    ) -> Result<Option<Attachment>, DbError> {
        let remote_id = remote_attachment_id.to_string();
        self.blocking(move |db| db.find_attachment_by_remote_id_sync(&remote_id))
            .await
    }
    async fn set_remote_reference(
        &self,
        id: &str,
        remote_attachment_id: &str,
        remote_url: &str,
    ) -> Result<Attachment, DbError> {
        let id = id.to_string();
        let remote_id = remote_attachment_id.to_string();
        let remote_url = remote_url.to_string();
        self.blocking(move |db| db.set_remote_reference_sync(&id, &remote_id, &remote_url))
            .await
    }
    async fn delete_attachment(&self, id: &str, force: bool) -> Result<Attachment, DbError> {
        let id = id.to_string();
        self.blocking(move |db| db.delete_attachment_sync(&id, force))
            .await
    }

    // -- Work item links --
    async fn link_attachment(&self, input: &CreateWorkItemLink) -> Result<WorkItemLink, DbError> {
        let input = input.clone();
        self.blocking(move |db| db.link_attachment_sync(&input)).await
    }
    async fn get_link(
        &self,
        attachment_id: &str,
        work_item_id: i64,
    ) -> Result<WorkItemLink, DbError> {
        let attachment_id = attachment_id.to_string();
        self.blocking(move |db| db.get_link_sync(&attachment_id, work_item_id))
            .await
    }
    async fn list_links_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<AttachmentRef>, DbError> {
        self.blocking(move |db| db.list_links_for_work_item_sync(work_item_id))
            .await
    }
    async fn list_links_for_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Vec<WorkItemLink>, DbError> {
        let attachment_id = attachment_id.to_string();
        self.blocking(move |db| db.list_links_for_attachment_sync(&attachment_id))
            .await
    }

    // -- Sync job queue --
    async fn enqueue_job(&self, input: &NewSyncJob) -> Result<EnqueueOutcome, DbError> {
        let input = input.clone();
        self.blocking(move |db| db.enqueue_job_sync(&input)).await
    }
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, DbError> {
        let worker_id = worker_id.to_string();
        self.blocking(move |db| db.claim_next_job_sync(&worker_id, now))
            .await
    }
    async fn complete_job(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<SyncJob, DbError> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let message = message.to_string();
        self.blocking(move |db| db.complete_job_sync(&id, &worker_id, &message))
            .await
    }
    async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<SyncJob, DbError> {
        let id = id.to_string();
        let worker_id = worker_id.to_string();
        let failure = failure.clone();
        self.blocking(move |db| db.fail_job_sync(&id, &worker_id, &failure))
            .await
    }
    async fn get_job(&self, id: &str) -> Result<SyncJob, DbError> {
        let id = id.to_string();
        self.blocking(move |db| db.get_job_sync(&id)).await
    }
    async fn list_jobs_for_attachment(
        &self,
        attachment_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        let attachment_id = attachment_id.to_string();
        self.blocking(move |db| db.list_jobs_for_attachment_sync(&attachment_id, limit))
            .await
    }
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.blocking(move |db| db.list_jobs_by_status_sync(status, limit))
            .await
    }
    async fn cancel_job(&self, id: &str) -> Result<SyncJob, DbError> {
        let id = id.to_string();
        self.blocking(move |db| db.cancel_job_sync(&id)).await
    }
    async fn reschedule_jobs(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        let lock_key = lock_key.to_string();
        self.blocking(move |db| db.reschedule_jobs_sync(&lock_key, now))
            .await
    }
    async fn find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.blocking(move |db| db.find_stale_jobs_sync(claimed_before))
            .await
    }
    async fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>, DbError> {
        self.blocking(|db| db.count_jobs_by_status_sync()).await
    }

    // -- Event log --
    async fn append_event(&self, event: &NewSyncEvent) -> Result<SyncEvent, DbError> {
        let event = event.clone();
        self.blocking(move |db| db.append_event_sync(&event)).await
    }
    async fn list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, DbError> {
        let job_id = job_id.map(|s| s.to_string());
        self.blocking(move |db| db.list_events_sync(job_id.as_deref(), limit))
            .await
    }
    async fn summarize_events(&self, since: DateTime<Utc>) -> Result<SeveritySummary, DbError> {
        self.blocking(move |db| db.summarize_events_sync(since))
            .await
    }

    // -- Upload sessions --
    async fn get_upload_session(
        &self,
        session_id: &str,
    ) -> Result<Option<UploadSession>, DbError> {
        let session_id = session_id.to_string();
        self.blocking(move |db| db.get_upload_session_sync(&session_id))
            .await
    }
    async fn claim_upload_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> Result<SessionClaim, DbError> {
        let session_id = session_id.to_string();
        self.blocking(move |db| db.claim_upload_session_sync(&session_id, now, pending_ttl))
            .await
    }
    async fn release_upload_session(&self, session_id: &str) -> Result<(), DbError> {
        let session_id = session_id.to_string();
        self.blocking(move |db| db.release_upload_session_sync(&session_id))
            .await
    }
    async fn complete_upload_session(
        &self,
        session_id: &str,
        attachment_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UploadSession, DbError> {
        let session_id = session_id.to_string();
        let attachment_id = attachment_id.to_string();
        self.blocking(move |db| {
            db.complete_upload_session_sync(&session_id, &attachment_id, now, ttl)
        })
        .await
    }
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        self.blocking(move |db| db.purge_expired_sessions_sync(now))
            .await
    }
}
