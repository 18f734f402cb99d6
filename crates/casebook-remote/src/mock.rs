use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    attachment_id_from_url, same_attachment, RemoteAttachment, RemoteError, RemoteRelation,
    RemoteTracker,
};

const MOCK_BASE_URL: &str = "https://mock.invalid/_apis/wit/attachments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Upload,
    List,
    Link,
    Unlink,
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    /// `None` fails forever.
    remaining: Option<u32>,
    status: u16,
}

#[derive(Default)]
struct MockState {
    blobs: HashMap<String, (String, Bytes)>,
    relations: HashMap<i64, Vec<RemoteRelation>>,
    calls: HashMap<MockOp, u64>,
    failures: HashMap<MockOp, FailurePlan>,
}

/// In-memory remote tracker for tests. Records calls per operation and
/// fails them on demand with a given HTTP status.
#[derive(Default)]
pub struct MockTracker {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before doing anything.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_always(&self, op: MockOp, status: u16) {
        self.with_state(|s| {
            s.failures.insert(op, FailurePlan { remaining: None, status });
        });
    }

    pub fn fail_times(&self, op: MockOp, times: u32, status: u16) {
        self.with_state(|s| {
            s.failures.insert(
                op,
                FailurePlan {
                    remaining: Some(times),
                    status,
                },
            );
        });
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failures.clear());
    }

    pub fn calls(&self, op: MockOp) -> u64 {
        self.with_state(|s| s.calls.get(&op).copied().unwrap_or(0))
    }

    /// Simulate someone attaching a file directly in the remote UI.
    pub fn seed_attachment(
        &self,
        work_item_id: i64,
        file_name: &str,
        data: impl Into<Bytes>,
    ) -> RemoteRelation {
        let data = data.into();
        self.with_state(|s| {
            let uploaded = store_blob(s, file_name, data.clone());
            let relation = RemoteRelation {
                url: uploaded.url,
                name: Some(file_name.to_string()),
                comment: None,
                size_bytes: Some(data.len() as i64),
            };
            s.relations
                .entry(work_item_id)
                .or_default()
                .push(relation.clone());
            relation
        })
    }

    pub fn relations(&self, work_item_id: i64) -> Vec<RemoteRelation> {
        self.with_state(|s| s.relations.get(&work_item_id).cloned().unwrap_or_default())
    }

    pub fn has_blob(&self, remote_attachment_id: &str) -> bool {
        self.with_state(|s| s.blobs.contains_key(&remote_attachment_id.to_ascii_lowercase()))
    }

    pub fn blob_count(&self) -> usize {
        self.with_state(|s| s.blobs.len())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Count the call and apply any scripted failure.
    async fn enter(&self, op: MockOp) -> Result<(), RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| {
            *s.calls.entry(op).or_insert(0) += 1;
            let Some(plan) = s.failures.get_mut(&op) else {
                return Ok(());
            };
            let status = plan.status;
            match plan.remaining {
                None => {}
                Some(0) => return Ok(()),
                Some(ref mut n) => *n -= 1,
            }
            Err(RemoteError::from_status(status, format!("mock {op:?} failure")))
        })
    }
}

fn store_blob(state: &mut MockState, file_name: &str, data: Bytes) -> RemoteAttachment {
    let id = uuid::Uuid::new_v4().to_string();
    let url = format!("{MOCK_BASE_URL}/{id}");
    state.blobs.insert(id.clone(), (file_name.to_string(), data));
    RemoteAttachment { id, url }
}

#[async_trait]
impl RemoteTracker for MockTracker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn upload_attachment(
        &self,
        file_name: &str,
        data: Bytes,
    ) -> Result<RemoteAttachment, RemoteError> {
        self.enter(MockOp::Upload).await?;
        Ok(self.with_state(|s| store_blob(s, file_name, data)))
    }

    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<RemoteRelation>, RemoteError> {
        self.enter(MockOp::List).await?;
        Ok(self.relations(work_item_id))
    }

    async fn link_attachment(
        &self,
        work_item_id: i64,
        url: &str,
        comment: &str,
    ) -> Result<bool, RemoteError> {
        self.enter(MockOp::Link).await?;
        self.with_state(|s| {
            let id = attachment_id_from_url(url)
                .ok_or_else(|| RemoteError::from_status(400, format!("bad url {url}")))?;
            let (name, data) = s
                .blobs
                .get(&id)
                .cloned()
                .ok_or_else(|| RemoteError::from_status(400, format!("unknown attachment {id}")))?;
            let relations = s.relations.entry(work_item_id).or_default();
            if relations.iter().any(|r| same_attachment(&r.url, url)) {
                return Ok(false);
            }
            relations.push(RemoteRelation {
                url: url.to_string(),
                name: Some(name),
                comment: Some(comment.to_string()),
                size_bytes: Some(data.len() as i64),
            });
            Ok(true)
        })
    }

    async fn unlink_attachment(&self, work_item_id: i64, url: &str) -> Result<bool, RemoteError> {
        self.enter(MockOp::Unlink).await?;
        Ok(self.with_state(|s| {
            let Some(relations) = s.relations.get_mut(&work_item_id) else {
                return false;
            };
            let before = relations.len();
            relations.retain(|r| !same_attachment(&r.url, url));
            relations.len() != before
        }))
    }

    async fn download_attachment(&self, url: &str) -> Result<Bytes, RemoteError> {
        self.enter(MockOp::Download).await?;
        self.with_state(|s| {
            attachment_id_from_url(url)
                .and_then(|id| s.blobs.get(&id))
                .map(|(_, data)| data.clone())
                .ok_or_else(|| RemoteError::NotFound(url.to_string()))
        })
    }

    async fn delete_attachment(&self, remote_attachment_id: &str) -> Result<(), RemoteError> {
        self.enter(MockOp::Delete).await?;
        self.with_state(|s| {
            let id = remote_attachment_id.to_ascii_lowercase();
            s.blobs.remove(&id);
            for relations in s.relations.values_mut() {
                relations.retain(|r| r.remote_id().as_deref() != Some(id.as_str()));
            }
        });
        Ok(())
    }
}
