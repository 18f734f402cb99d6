use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use casebook_core::attachment::{Attachment, AttachmentRef, AttachmentStatus};
use casebook_core::sync_event::SyncEvent;
use casebook_core::sync_job::SyncJob;

use crate::types::{
    AttachmentContent, DedupCheck, DeleteOptions, JobResponse, JobsResponse, LinkRequest,
    LinkResult, SessionResult, SyncSummary, UploadRequest, UploadResult,
};
use crate::{ServiceError, SyncService};

/// Response of the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub accepted: bool,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Async HTTP client implementation of SyncService.
/// Connects to a running casebook-server.
pub struct HttpService {
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

impl HttpService {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            api_key: None,
        }
    }

    pub fn with_api_key(base_url: &str, key: String) -> Self {
        Self {
            api_key: Some(key),
            ..Self::new(base_url)
        }
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Check if the server is reachable.
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|e| ServiceError::Internal(format!("connection failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::Internal(format!(
                "health check failed: {}",
                resp.status()
            )))
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        self.with_auth(builder)
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let resp = self.send(self.client.get(self.url(path))).await?;
        handle_response(resp).await
    }

    async fn post_json<B: Serialize + Sync, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let resp = self
            .send(self.client.post(self.url(path)).json(body))
            .await?;
        handle_response(resp).await
    }

    async fn post_empty<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let resp = self.send(self.client.post(self.url(path))).await?;
        handle_response(resp).await
    }

    async fn delete_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let resp = self.send(self.client.delete(self.url(path))).await?;
        handle_response(resp).await
    }

    // -- Convenience methods (not on trait) --

    /// Post a raw webhook body with the given signature header value.
    /// Returns the HTTP status alongside the decoded body.
    pub async fn post_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(u16, WebhookResponse), ServiceError> {
        let mut builder = self
            .client
            .post(self.url("/webhooks/workitem"))
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        if let Some(sig) = signature {
            builder = builder.header("X-Casebook-Signature", sig);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let status = resp.status().as_u16();
        let parsed = resp
            .json::<WebhookResponse>()
            .await
            .map_err(|e| ServiceError::Internal(format!("json decode: {e}")))?;
        Ok((status, parsed))
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        resp.json::<T>()
            .await
            .map_err(|e| ServiceError::Internal(format!("json decode: {e}")))
    } else {
        Err(parse_error_with_status(status, resp).await)
    }
}

async fn parse_error_with_status(status: StatusCode, resp: reqwest::Response) -> ServiceError {
    let body = resp.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or(body);
    match status {
        StatusCode::BAD_REQUEST => ServiceError::Validation(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth(msg),
        StatusCode::NOT_FOUND => ServiceError::NotFound(msg),
        StatusCode::CONFLICT => ServiceError::Conflict(msg),
        StatusCode::BAD_GATEWAY => ServiceError::RemoteApi(msg),
        _ => ServiceError::Internal(msg),
    }
}

#[async_trait]
impl SyncService for HttpService {
    async fn upload(&self, input: &UploadRequest) -> Result<UploadResult, ServiceError> {
        self.post_json("/sync/upload", input).await
    }

    async fn link_attachment(&self, input: &LinkRequest) -> Result<LinkResult, ServiceError> {
        self.post_json("/sync/link-attachment", input).await
    }

    async fn delete_attachment(
        &self,
        attachment_id: &str,
        options: &DeleteOptions,
    ) -> Result<SyncJob, ServiceError> {
        let resp: JobResponse = self
            .delete_json(&format!(
                "/sync/attachments/{attachment_id}?force={}&delete_remote={}",
                options.force, options.delete_remote
            ))
            .await?;
        Ok(resp.job)
    }

    async fn force_sync(&self, attachment_id: &str) -> Result<Vec<SyncJob>, ServiceError> {
        let resp: JobsResponse = self
            .post_empty(&format!("/sync/force-sync/{attachment_id}"))
            .await?;
        Ok(resp.jobs)
    }

    async fn request_download(&self, attachment_id: &str) -> Result<SyncJob, ServiceError> {
        let resp: JobResponse = self
            .post_empty(&format!("/sync/download/{attachment_id}"))
            .await?;
        Ok(resp.job)
    }

    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<AttachmentRef>, ServiceError> {
        self.get_json(&format!("/sync/attachments/{work_item_id}")).await
    }

    async fn get_status(&self, attachment_id: &str) -> Result<AttachmentStatus, ServiceError> {
        self.get_json(&format!("/sync/status/{attachment_id}")).await
    }

    async fn check_duplicate(&self, digest: &str) -> Result<DedupCheck, ServiceError> {
        self.get_json(&format!("/sync/deduplication/{digest}")).await
    }

    async fn resolve_upload_session(
        &self,
        session_id: &str,
    ) -> Result<SessionResult, ServiceError> {
        self.get_json(&format!("/sync/upload-session/{session_id}"))
            .await
    }

    async fn get_attachment_content(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentContent, ServiceError> {
        // Metadata first so a missing attachment is a clean NotFound.
        let status: AttachmentStatus = self.get_status(attachment_id).await?;
        let attachment: Attachment = status.attachment;
        let resp = self
            .send(
                self.client
                    .get(self.url(&format!("/sync/attachments/{attachment_id}/content"))),
            )
            .await?;
        let code = resp.status();
        if !code.is_success() {
            return Err(parse_error_with_status(code, resp).await);
        }
        let data = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::Internal(format!("read body: {e}")))?;
        Ok(AttachmentContent { attachment, data })
    }

    async fn get_job(&self, job_id: &str) -> Result<SyncJob, ServiceError> {
        self.get_json(&format!("/sync/jobs/{job_id}")).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<SyncJob, ServiceError> {
        self.delete_json(&format!("/sync/jobs/{job_id}")).await
    }

    async fn list_dead_jobs(&self, limit: i64) -> Result<Vec<SyncJob>, ServiceError> {
        self.get_json(&format!("/sync/dead-jobs?limit={limit}")).await
    }

    async fn summary(&self, window_secs: i64) -> Result<SyncSummary, ServiceError> {
        self.get_json(&format!("/sync/summary?windowSecs={window_secs}"))
            .await
    }

    async fn list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, ServiceError> {
        let path = match job_id {
            Some(id) => format!("/sync/events?jobId={id}&limit={limit}"),
            None => format!("/sync/events?limit={limit}"),
        };
        self.get_json(&path).await
    }
}
