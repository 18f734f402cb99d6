use async_trait::async_trait;
use thiserror::Error;

use casebook_core::attachment::{AttachmentRef, AttachmentStatus};
use casebook_core::sync_event::SyncEvent;
use casebook_core::sync_job::SyncJob;
use casebook_core::SyncError;

use crate::types::{
    AttachmentContent, DedupCheck, DeleteOptions, LinkRequest, LinkResult, SessionResult,
    SyncSummary, UploadRequest, UploadResult,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote api error: {0}")]
    RemoteApi(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SyncError> for ServiceError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Validation(m) => ServiceError::Validation(m),
            SyncError::Auth(m) => ServiceError::Auth(m),
            SyncError::NotFound(m) => ServiceError::NotFound(m),
            SyncError::Conflict(m) => ServiceError::Conflict(m),
            SyncError::RemoteApi(m) | SyncError::Timeout(m) => ServiceError::RemoteApi(m),
            SyncError::Storage(m) => ServiceError::Storage(m),
            SyncError::Internal(m) => ServiceError::Internal(m),
        }
    }
}

impl From<casebook_db::DbError> for ServiceError {
    fn from(e: casebook_db::DbError) -> Self {
        SyncError::from(e).into()
    }
}

impl From<casebook_store::StoreError> for ServiceError {
    fn from(e: casebook_store::StoreError) -> Self {
        match e {
            casebook_store::StoreError::NotFound(m) => ServiceError::NotFound(m),
            casebook_store::StoreError::Internal(m) => ServiceError::Storage(m),
        }
    }
}

/// The synchronous surface of the attachment sync engine.
///
/// HTTP handlers and the CLI program against this trait.
/// `LocalSyncService` talks to the database and content store directly.
/// `HttpService` talks to a running casebook-server.
#[async_trait]
pub trait SyncService: Send + Sync {
    // -- Client requests --
    async fn upload(&self, input: &UploadRequest) -> Result<UploadResult, ServiceError>;
    async fn link_attachment(&self, input: &LinkRequest) -> Result<LinkResult, ServiceError>;
    async fn delete_attachment(
        &self,
        attachment_id: &str,
        options: &DeleteOptions,
    ) -> Result<SyncJob, ServiceError>;
    async fn force_sync(&self, attachment_id: &str) -> Result<Vec<SyncJob>, ServiceError>;
    async fn request_download(&self, attachment_id: &str) -> Result<SyncJob, ServiceError>;

    // -- Queries --
    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<AttachmentRef>, ServiceError>;
    async fn get_status(&self, attachment_id: &str) -> Result<AttachmentStatus, ServiceError>;
    async fn check_duplicate(&self, digest: &str) -> Result<DedupCheck, ServiceError>;
    async fn resolve_upload_session(&self, session_id: &str)
        -> Result<SessionResult, ServiceError>;
    async fn get_attachment_content(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentContent, ServiceError>;

    // -- Jobs and event log --
    async fn get_job(&self, job_id: &str) -> Result<SyncJob, ServiceError>;
    async fn cancel_job(&self, job_id: &str) -> Result<SyncJob, ServiceError>;
    async fn list_dead_jobs(&self, limit: i64) -> Result<Vec<SyncJob>, ServiceError>;
    async fn summary(&self, window_secs: i64) -> Result<SyncSummary, ServiceError>;
    async fn list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, ServiceError>;
}
