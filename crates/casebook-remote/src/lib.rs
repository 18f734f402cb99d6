pub mod azure;
pub mod mock;

pub use azure::AzureDevOpsTracker;
pub use mock::{MockOp, MockTracker};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use casebook_core::SyncError;

pub const DEFAULT_API_VERSION: &str = "7.1";

/// Relation type the work-item API uses for file attachments.
pub const ATTACHED_FILE_REL: &str = "AttachedFile";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote rejected credentials: {0}")]
    Auth(String),

    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Auth(format!("status {status}: {message}")),
            404 => RemoteError::NotFound(message),
            _ => RemoteError::Status { status, message },
        }
    }

    /// Throttling, server-side failures and broken connections are worth
    /// another attempt; everything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            RemoteError::Transport(_) | RemoteError::InvalidResponse(_) => true,
            RemoteError::Auth(_) | RemoteError::NotFound(_) => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        let retryable = e.is_retryable();
        match e {
            RemoteError::Auth(msg) => SyncError::Auth(msg),
            RemoteError::NotFound(msg) => SyncError::NotFound(format!("remote: {msg}")),
            RemoteError::Status { status: 409, message } => {
                SyncError::Conflict(format!("remote: {message}"))
            }
            other if retryable => SyncError::RemoteApi(other.to_string()),
            other => SyncError::Validation(format!("remote rejected request: {other}")),
        }
    }
}

/// Result of pushing a blob to the remote attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub id: String,
    pub url: String,
}

/// An `AttachedFile` relation on a remote work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRelation {
    pub url: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub size_bytes: Option<i64>,
}

impl RemoteRelation {
    pub fn remote_id(&self) -> Option<String> {
        attachment_id_from_url(&self.url)
    }
}

/// The remote work-item tracking system, reduced to the attachment
/// operations the sync worker needs.
#[async_trait]
pub trait RemoteTracker: Send + Sync {
    fn name(&self) -> &str;

    async fn upload_attachment(
        &self,
        file_name: &str,
        data: Bytes,
    ) -> Result<RemoteAttachment, RemoteError>;

    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<RemoteRelation>, RemoteError>;

    /// Attach `url` to the work item. Returns `false` if it was already attached.
    async fn link_attachment(
        &self,
        work_item_id: i64,
        url: &str,
        comment: &str,
    ) -> Result<bool, RemoteError>;

    /// Remove the relation to `url`. Returns `false` if there was none.
    async fn unlink_attachment(&self, work_item_id: i64, url: &str) -> Result<bool, RemoteError>;

    async fn download_attachment(&self, url: &str) -> Result<Bytes, RemoteError>;

    /// Delete the remote blob. Already-deleted blobs are not an error.
    async fn delete_attachment(&self, remote_attachment_id: &str) -> Result<(), RemoteError>;
}

/// Attachment urls end in the attachment id:
/// `https://dev.azure.com/org/project/_apis/wit/attachments/<id>?fileName=x`.
pub fn attachment_id_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(last.to_ascii_lowercase())
}

/// Two attachment urls point at the same blob.
pub fn same_attachment(a: &str, b: &str) -> bool {
    match (attachment_id_from_url(a), attachment_id_from_url(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Connection settings for Azure DevOps.
#[derive(Clone)]
pub struct RemoteConfig {
    /// e.g. `https://dev.azure.com/contoso`
    pub org_url: String,
    pub project: String,
    pub pat: String,
    pub api_version: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("org_url", &self.org_url)
            .field("project", &self.project)
            .field("pat", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl RemoteConfig {
    /// Reads `CASEBOOK_ADO_ORG_URL`, `CASEBOOK_ADO_PROJECT`, `CASEBOOK_ADO_PAT`
    /// and optionally `CASEBOOK_ADO_API_VERSION`. `None` unless the first
    /// three are all set.
    pub fn from_env() -> Option<Self> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            org_url: non_empty("CASEBOOK_ADO_ORG_URL")?,
            project: non_empty("CASEBOOK_ADO_PROJECT")?,
            pat: non_empty("CASEBOOK_ADO_PAT")?,
            api_version: non_empty("CASEBOOK_ADO_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }
}

pub fn create_tracker(config: &RemoteConfig) -> Result<Arc<dyn RemoteTracker>, RemoteError> {
    Ok(Arc::new(AzureDevOpsTracker::new(config)?))
}
