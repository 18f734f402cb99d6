use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;
/// How long a claimed session stays pending before another request may take it over.
pub const SESSION_CLAIM_TTL_SECS: i64 = 5 * 60;

/// Idempotency record for a client-supplied upload session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub attachment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Claimed by a request that has not stored its content yet.
    pub fn is_pending(&self) -> bool {
        self.attachment_id.is_none()
    }
}

/// Outcome of claiming a session id before any content is written.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionClaim {
    /// The caller owns the session and must complete or release it.
    Claimed,
    /// A live session already exists, either pending or resolved.
    Existing(UploadSession),
}

/// Session ids are client-generated UUIDs; normalised to lowercase hyphenated form.
pub fn normalize_session_id(raw: &str) -> Result<String, SyncError> {
    uuid::Uuid::parse_str(raw.trim())
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| SyncError::Validation(format!("session id is not a UUID: {raw:?}")))
}
