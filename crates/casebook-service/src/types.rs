use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use casebook_core::attachment::Attachment;
use casebook_core::sync_event::SeveritySummary;
use casebook_core::sync_job::{JobStatusCount, SyncJob};
use casebook_core::upload_session::UploadSession;
use casebook_core::work_item_link::WorkItemLink;

use crate::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub content_base64: String,
    #[serde(default)]
    pub work_item_id: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, content: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            content_base64: base64::engine::general_purpose::STANDARD.encode(content),
            work_item_id: None,
            session_id: None,
            comment: None,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn for_work_item(mut self, work_item_id: i64) -> Self {
        self.work_item_id = Some(work_item_id);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn decode_content(&self) -> Result<Bytes, ServiceError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.content_base64.trim())
            .map(Bytes::from)
            .map_err(|e| ServiceError::Validation(format!("content_base64: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub attachment: Attachment,
    /// The content was already known; no blob was written.
    pub deduplicated: bool,
    /// Answered from a completed upload session without any writes.
    pub replayed: bool,
    #[serde(default)]
    pub link: Option<WorkItemLink>,
    #[serde(default)]
    pub jobs: Vec<SyncJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub attachment_id: String,
    pub work_item_id: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkResult {
    pub link: WorkItemLink,
    pub job: SyncJob,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteOptions {
    /// Cascade-delete remaining links instead of refusing.
    pub force: bool,
    /// Also delete the blob on the remote side.
    pub delete_remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job: SyncJob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsResponse {
    pub jobs: Vec<SyncJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupCheck {
    pub digest: String,
    pub exists: bool,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    #[serde(flatten)]
    pub session: UploadSession,
    pub attachment: Attachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub window_secs: i64,
    pub events: SeveritySummary,
    pub jobs: Vec<JobStatusCount>,
}

#[derive(Debug, Clone)]
pub struct AttachmentContent {
    pub attachment: Attachment,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_request_round_trips_content() {
        let req = UploadRequest::new("a.bin", &[0, 159, 146, 150]).for_work_item(9);
        assert_eq!(req.decode_content().unwrap().as_ref(), &[0, 159, 146, 150]);
        assert_eq!(req.work_item_id, Some(9));
    }

    #[test]
    fn bad_base64_is_validation_error() {
        let mut req = UploadRequest::new("a.bin", b"x");
        req.content_base64 = "***".into();
        assert!(matches!(
            req.decode_content(),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn upload_request_optional_fields_default() {
        let req: UploadRequest =
            serde_json::from_str(r#"{"file_name":"a.txt","content_base64":"aGk="}"#).unwrap();
        assert!(req.work_item_id.is_none());
        assert!(req.session_id.is_none());
        assert_eq!(req.decode_content().unwrap().as_ref(), b"hi");
    }
}
