use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::{
    same_attachment, RemoteAttachment, RemoteConfig, RemoteError, RemoteRelation, RemoteTracker,
    ATTACHED_FILE_REL,
};

/// Azure DevOps work-item tracking REST client.
#[derive(Debug)]
pub struct AzureDevOpsTracker {
    /// `{org_url}/{project}`
    base: Url,
    api_version: String,
    auth_header: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WorkItem {
    #[serde(default)]
    relations: Option<Vec<Relation>>,
}

#[derive(Debug, Deserialize)]
struct Relation {
    rel: String,
    url: String,
    #[serde(default)]
    attributes: RelationAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationAttributes {
    name: Option<String>,
    comment: Option<String>,
    resource_size: Option<i64>,
}

impl AzureDevOpsTracker {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let mut base = Url::parse(config.org_url.trim_end_matches('/'))
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid org url: {e}")))?;
        base.path_segments_mut()
            .map_err(|_| RemoteError::InvalidResponse("org url cannot be a base".into()))?
            .pop_if_empty()
            .push(&config.project);

        let token = base64::engine::general_purpose::STANDARD.encode(format!(":{}", config.pat));

        let client = reqwest::Client::builder()
            .user_agent("casebook-sync")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Transport(format!("HTTP client init: {e}")))?;

        Ok(Self {
            base,
            api_version: config.api_version.clone(),
            auth_header: format!("Basic {token}"),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("HTTP request failed: {e}")))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let mut text = resp.text().await.unwrap_or_default();
        text.truncate(512);
        Err(RemoteError::from_status(status, text))
    }

    async fn fetch_relations(&self, work_item_id: i64) -> Result<Vec<Relation>, RemoteError> {
        let url = self.endpoint(&["_apis", "wit", "workitems", &work_item_id.to_string()]);
        let resp = self
            .send(
                self.request(reqwest::Method::GET, url)
                    .query(&[("$expand", "relations"), ("api-version", self.api_version.as_str())]),
            )
            .await?;
        let item: WorkItem = resp
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("parse work item: {e}")))?;
        Ok(item.relations.unwrap_or_default())
    }

    async fn patch_work_item(
        &self,
        work_item_id: i64,
        ops: serde_json::Value,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint(&["_apis", "wit", "workitems", &work_item_id.to_string()]);
        let body = serde_json::to_vec(&ops)
            .map_err(|e| RemoteError::InvalidResponse(format!("encode patch: {e}")))?;
        self.send(
            self.request(reqwest::Method::PATCH, url)
                .query(&[("api-version", self.api_version.as_str())])
                .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
                .body(body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteTracker for AzureDevOpsTracker {
    fn name(&self) -> &str {
        "azure-devops"
    }

    async fn upload_attachment(
        &self,
        file_name: &str,
        data: Bytes,
    ) -> Result<RemoteAttachment, RemoteError> {
        let size = data.len();
        let url = self.endpoint(&["_apis", "wit", "attachments"]);
        let resp = self
            .send(
                self.request(reqwest::Method::POST, url)
                    .query(&[("fileName", file_name), ("api-version", self.api_version.as_str())])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(data),
            )
            .await?;
        let uploaded: RemoteAttachment = resp
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("parse upload response: {e}")))?;
        info!(remote_id = %uploaded.id, size, "uploaded attachment {file_name}");
        Ok(uploaded)
    }

    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<RemoteRelation>, RemoteError> {
        let relations = self.fetch_relations(work_item_id).await?;
        Ok(relations
            .into_iter()
            .filter(|r| r.rel == ATTACHED_FILE_REL)
            .map(|r| RemoteRelation {
                url: r.url,
                name: r.attributes.name,
                comment: r.attributes.comment,
                size_bytes: r.attributes.resource_size,
            })
            .collect())
    }

    async fn link_attachment(
        &self,
        work_item_id: i64,
        url: &str,
        comment: &str,
    ) -> Result<bool, RemoteError> {
        let relations = self.fetch_relations(work_item_id).await?;
        if relations
            .iter()
            .any(|r| r.rel == ATTACHED_FILE_REL && same_attachment(&r.url, url))
        {
            debug!(work_item_id, "attachment already related");
            return Ok(false);
        }

        let ops = json!([{
            "op": "add",
            "path": "/relations/-",
            "value": {
                "rel": ATTACHED_FILE_REL,
                "url": url,
                "attributes": { "comment": comment },
            },
        }]);
        self.patch_work_item(work_item_id, ops).await?;
        info!(work_item_id, "linked attachment");
        Ok(true)
    }

    async fn unlink_attachment(&self, work_item_id: i64, url: &str) -> Result<bool, RemoteError> {
        let relations = match self.fetch_relations(work_item_id).await {
            Ok(r) => r,
            Err(RemoteError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        // Relation indices are positions in the full list, not just attachments.
        let Some(index) = relations
            .iter()
            .position(|r| r.rel == ATTACHED_FILE_REL && same_attachment(&r.url, url))
        else {
            return Ok(false);
        };

        let ops = json!([{ "op": "remove", "path": format!("/relations/{index}") }]);
        self.patch_work_item(work_item_id, ops).await?;
        info!(work_item_id, "unlinked attachment");
        Ok(true)
    }

    async fn download_attachment(&self, url: &str) -> Result<Bytes, RemoteError> {
        let parsed = Url::parse(url)
            .map_err(|e| RemoteError::InvalidResponse(format!("invalid attachment url: {e}")))?;
        let resp = self
            .send(
                self.request(reqwest::Method::GET, parsed)
                    .query(&[("download", "true"), ("api-version", self.api_version.as_str())]),
            )
            .await?;
        resp.bytes()
            .await
            .map_err(|e| RemoteError::Transport(format!("read attachment body: {e}")))
    }

    async fn delete_attachment(&self, remote_attachment_id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&["_apis", "wit", "attachments", remote_attachment_id]);
        match self
            .send(
                self.request(reqwest::Method::DELETE, url)
                    .query(&[("api-version", self.api_version.as_str())]),
            )
            .await
        {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
