use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Upload,
    Download,
    Link,
    Delete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Upload => "upload",
            JobType::Download => "download",
            JobType::Link => "link",
            JobType::Delete => "delete",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(JobType::Upload),
            "download" => Some(JobType::Download),
            "link" => Some(JobType::Link),
            "delete" => Some(JobType::Delete),
            _ => None,
        }
    }

    /// Whether a new request folds into an already pending job of the
    /// same type and target instead of queueing a second one.
    pub fn coalesces(&self) -> bool {
        !matches!(self, JobType::Delete)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    /// Terminal states never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (attachment, work item) pair a job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub attachment_id: Option<String>,
    pub work_item_id: Option<i64>,
}

impl TargetKey {
    pub fn attachment(attachment_id: &str) -> Self {
        Self {
            attachment_id: Some(attachment_id.to_string()),
            work_item_id: None,
        }
    }

    pub fn link(attachment_id: &str, work_item_id: i64) -> Self {
        Self {
            attachment_id: Some(attachment_id.to_string()),
            work_item_id: Some(work_item_id),
        }
    }

    pub fn work_item(work_item_id: i64) -> Self {
        Self {
            attachment_id: None,
            work_item_id: Some(work_item_id),
        }
    }

    pub fn as_key(&self) -> String {
        match (&self.attachment_id, self.work_item_id) {
            (Some(a), Some(w)) => format!("attachment:{a}/work_item:{w}"),
            (Some(a), None) => format!("attachment:{a}"),
            (None, Some(w)) => format!("work_item:{w}"),
            (None, None) => String::new(),
        }
    }

    /// Scope used for the one-in-progress-job rule. Every job touching an
    /// attachment serialises on that attachment, whatever work item it
    /// also names.
    pub fn lock_key(&self) -> String {
        match (&self.attachment_id, self.work_item_id) {
            (Some(a), _) => format!("attachment:{a}"),
            (None, Some(w)) => format!("work_item:{w}"),
            (None, None) => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attachment_id.is_none() && self.work_item_id.is_none()
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Job-type specific parameters, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    /// DELETE: cascade links instead of refusing.
    pub force: bool,
    /// DELETE: also delete the remote blob, not only its associations.
    pub delete_remote_blob: bool,
    /// What caused the job (`api`, `webhook:workitem.updated`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl JobPayload {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(s: &str) -> Self {
        serde_json::from_str(s).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub job_type: JobType,
    pub target_key: String,
    pub lock_key: String,
    pub attachment_id: Option<String>,
    pub work_item_id: Option<i64>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn target(&self) -> TargetKey {
        TargetKey {
            attachment_id: self.attachment_id.clone(),
            work_item_id: self.work_item_id,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub job_type: JobType,
    pub target: TargetKey,
    pub payload: JobPayload,
    pub max_attempts: i32,
    /// Message recorded on the enqueue event.
    pub message: String,
}

impl NewSyncJob {
    pub fn new(job_type: JobType, target: TargetKey) -> Self {
        let message = format!("{job_type} queued for {target}");
        Self {
            job_type,
            target,
            payload: JobPayload::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            message,
        }
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job: SyncJob,
    /// True when an already pending job was returned instead of a new row.
    pub coalesced: bool,
}

/// How a failed attempt leaves the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFailure {
    /// Back to QUEUED, eligible again at `next_run_at`.
    Retry {
        error: String,
        next_run_at: DateTime<Utc>,
    },
    /// Retryable error but attempts are exhausted.
    Dead { error: String },
    /// Non-retryable error.
    Fatal { error: String },
}

impl JobFailure {
    pub fn error(&self) -> &str {
        match self {
            JobFailure::Retry { error, .. }
            | JobFailure::Dead { error }
            | JobFailure::Fatal { error } => error,
        }
    }

    pub fn resulting_status(&self) -> JobStatus {
        match self {
            JobFailure::Retry { .. } => JobStatus::Queued,
            JobFailure::Dead { .. } => JobStatus::Dead,
            JobFailure::Fatal { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCount {
    pub status: String,
    pub count: i64,
}
