use thiserror::Error;

/// Error taxonomy shared by every component of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
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

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a failed job attempt with this error should be retried
    /// after backoff rather than failed outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteApi(_) | SyncError::Storage(_) | SyncError::Timeout(_)
        )
    }

    /// Short machine-readable name, used in logs and event messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::Auth(_) => "auth",
            SyncError::NotFound(_) => "not_found",
            SyncError::Conflict(_) => "conflict",
            SyncError::RemoteApi(_) => "remote_api",
            SyncError::Storage(_) => "storage",
            SyncError::Timeout(_) => "timeout",
            SyncError::Internal(_) => "internal",
        }
    }
}
