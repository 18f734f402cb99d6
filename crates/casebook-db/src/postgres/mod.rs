pub(crate) mod migrations;
pub mod queries;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use casebook_core::attachment::{Attachment, AttachmentRef, RegisterAttachment, Registration};
use casebook_core::sync_event::{NewSyncEvent, SeveritySummary, SyncEvent};
use casebook_core::sync_job::{
    EnqueueOutcome, JobFailure, JobStatus, JobStatusCount, NewSyncJob, SyncJob,
};
use casebook_core::upload_session::{SessionClaim, UploadSession};
use casebook_core::work_item_link::{CreateWorkItemLink, WorkItemLink};

use crate::{Database, DbError};

/// Map a sqlx::Error into a DbError::Internal.
pub(crate) fn pg_err(e: sqlx::Error) -> DbError {
    DbError::Internal(e.to_string())
}

/// Create a DbError::NotFound with the given entity description.
pub(crate) fn pg_not_found(entity: &str) -> DbError {
    DbError::NotFound(entity.to_string())
}

/// True for SQLSTATE 23505 (unique_violation).
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct PostgresDatabase {
    pub(crate) pool: PgPool,
}

impl PostgresDatabase {
    /// Connect to a Postgres database and run migrations.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(pg_err)?;

        let db = Self { pool };
        migrations::run(&db.pool).await?;
        Ok(db)
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    // -- Attachment registry --
    async fn register_attachment(
        &self,
        input: &RegisterAttachment,
    ) -> Result<Registration, DbError> {
        self.pg_register_attachment(input).await
    }
    async fn get_attachment(&self, id: &str) -> Result<Attachment, DbError> {
        self.pg_get_attachment(id).await
    }
    async fn find_attachment_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<Attachment>, DbError> {
        self.pg_find_attachment_by_digest(digest).await
    }
    async fn find_attachment_by_remote_id(
        &self,
        remote_attachment_id: &str,
    ) -> Result<Option<Attachment>, DbError> {
        self.pg_find_attachment_by_remote_id(remote_attachment_id)
            .await
    }
    async fn set_remote_reference(
        &self,
        id: &str,
        remote_attachment_id: &str,
        remote_url: &str,
    ) -> Result<Attachment, DbError> {
        self.pg_set_remote_reference(id, remote_attachment_id, remote_url)
            .await
    }
    async fn delete_attachment(&self, id: &str, force: bool) -> Result<Attachment, DbError> {
        self.pg_delete_attachment(id, force).await
    }

    // -- Work item links --
    async fn link_attachment(&self, input: &CreateWorkItemLink) -> Result<WorkItemLink, DbError> {
        self.pg_link_attachment(input).await
    }
    async fn get_link(
        &self,
        attachment_id: &str,
        work_item_id: i64,
    ) -> Result<WorkItemLink, DbError> {
        self.pg_get_link(attachment_id, work_item_id).await
    }
    async fn list_links_for_work_item(
        &self,
        work_item_id: i64,
    ) -> Result<Vec<AttachmentRef>, DbError> {
        self.pg_list_links_for_work_item(work_item_id).await
    }
    async fn list_links_for_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Vec<WorkItemLink>, DbError> {
        self.pg_list_links_for_attachment(attachment_id).await
    }

    // -- Sync job queue --
    async fn enqueue_job(&self, input: &NewSyncJob) -> Result<EnqueueOutcome, DbError> {
        self.pg_enqueue_job(input).await
    }
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, DbError> {
        self.pg_claim_next_job(worker_id, now).await
    }
    async fn complete_job(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<SyncJob, DbError> {
        self.pg_complete_job(id, worker_id, message).await
    }
    async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<SyncJob, DbError> {
        self.pg_fail_job(id, worker_id, failure).await
    }
    async fn get_job(&self, id: &str) -> Result<SyncJob, DbError> {
        self.pg_get_job(id).await
    }
    async fn list_jobs_for_attachment(
        &self,
        attachment_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.pg_list_jobs_for_attachment(attachment_id, limit).await
    }
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.pg_list_jobs_by_status(status, limit).await
    }
    async fn cancel_job(&self, id: &str) -> Result<SyncJob, DbError> {
        self.pg_cancel_job(id).await
    }
    async fn reschedule_jobs(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.pg_reschedule_jobs(lock_key, now).await
    }
    async fn find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.pg_find_stale_jobs(claimed_before).await
    }
    async fn count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>, DbError> {
        self.pg_count_jobs_by_status().await
    }

    // -- Event log --
    async fn append_event(&self, event: &NewSyncEvent) -> Result<SyncEvent, DbError> {
        self.pg_append_event(event).await
    }
    async fn list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, DbError> {
        self.pg_list_events(job_id, limit).await
    }
    async fn summarize_events(&self, since: DateTime<Utc>) -> Result<SeveritySummary, DbError> {
        self.pg_summarize_events(since).await
    }

    // -- Upload sessions --
    async fn get_upload_session(
        &self,
        session_id: &str,
    ) -> Result<Option<UploadSession>, DbError> {
        self.pg_get_upload_session(session_id).await
    }
    async fn claim_upload_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        pending_ttl: chrono::Duration,
    ) -> Result<SessionClaim, DbError> {
        self.pg_claim_upload_session(session_id, now, pending_ttl)
            .await
    }
    async fn release_upload_session(&self, session_id: &str) -> Result<(), DbError> {
        self.pg_release_upload_session(session_id).await
    }
    async fn complete_upload_session(
        &self,
        session_id: &str,
        attachment_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UploadSession, DbError> {
        self.pg_complete_upload_session(session_id, attachment_id, now, ttl)
            .await
    }
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        self.pg_purge_expired_sessions(now).await
    }
}
