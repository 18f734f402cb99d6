use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::sync_job::SyncJob;
use crate::work_item_link::WorkItemLink;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One row per distinct content digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub digest: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub file_name: String,
    #[serde(default)]
    pub remote_attachment_id: Option<String>,
    #[serde(default)]
    pub remote_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_uploaded(&self) -> bool {
        self.remote_attachment_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAttachment {
    pub digest: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub file_name: String,
    /// Set when the attachment originates from the remote system (downloads).
    #[serde(default)]
    pub remote_attachment_id: Option<String>,
    #[serde(default)]
    pub remote_url: Option<String>,
}

impl RegisterAttachment {
    pub fn validate(&self) -> Result<(), SyncError> {
        validate_digest(&self.digest)?;
        if self.size_bytes < 0 {
            return Err(SyncError::Validation("size must not be negative".into()));
        }
        validate_file_name(&self.file_name)
    }
}

/// Result of an idempotent registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub attachment: Attachment,
    /// False when a row with the same digest already existed.
    pub created: bool,
}

/// An attachment as seen from one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment: Attachment,
    pub comment: String,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentStatus {
    pub attachment: Attachment,
    pub links: Vec<WorkItemLink>,
    pub recent_jobs: Vec<SyncJob>,
}

/// A digest is a lowercase hex SHA-256: 64 characters.
pub fn validate_digest(digest: &str) -> Result<(), SyncError> {
    let ok = digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(SyncError::Validation(format!("malformed digest: {digest:?}")))
    }
}

pub fn validate_file_name(name: &str) -> Result<(), SyncError> {
    if name.trim().is_empty() {
        return Err(SyncError::Validation("file name must not be empty".into()));
    }
    if name.len() > 255 {
        return Err(SyncError::Validation("file name longer than 255 bytes".into()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(SyncError::Validation(format!(
            "file name contains a path separator: {name:?}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(SyncError::Validation(format!(
            "file name contains a control character: {name:?}"
        )));
    }
    Ok(())
}

/// Normalise a caller-supplied MIME type, falling back to octet-stream.
pub fn normalize_mime(mime: Option<&str>) -> String {
    match mime.map(str::trim) {
        Some(m) if !m.is_empty() && m.contains('/') => m.to_ascii_lowercase(),
        _ => DEFAULT_MIME_TYPE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn digest_validation() {
        assert!(validate_digest(D).is_ok());
        assert!(validate_digest(&D.to_uppercase()).is_err());
        assert!(validate_digest(&D[..63]).is_err());
        assert!(validate_digest("").is_err());
        assert!(validate_digest(&format!("{}g", &D[..63])).is_err());
    }

    #[test]
    fn file_name_validation() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("  ").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a\\b.txt").is_err());
        assert!(validate_file_name(&"x".repeat(256)).is_err());
        assert!(validate_file_name("a\nb.txt").is_err());
        assert!(validate_file_name("tab\there.txt").is_err());
        assert!(validate_file_name("bell\u{7}.txt").is_err());
        assert!(validate_file_name("next\u{85}line.txt").is_err());
        assert!(validate_file_name("résumé 2024.pdf").is_ok());
    }

    #[test]
    fn mime_normalisation() {
        assert_eq!(normalize_mime(Some("Image/PNG")), "image/png");
        assert_eq!(normalize_mime(Some("")), DEFAULT_MIME_TYPE);
        assert_eq!(normalize_mime(Some("garbage")), DEFAULT_MIME_TYPE);
        assert_eq!(normalize_mime(None), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn register_rejects_negative_size() {
        let input = RegisterAttachment {
            digest: D.into(),
            size_bytes: -1,
            mime_type: DEFAULT_MIME_TYPE.into(),
            file_name: "a.bin".into(),
            remote_attachment_id: None,
            remote_url: None,
        };
        assert!(matches!(input.validate(), Err(SyncError::Validation(_))));
    }
}
