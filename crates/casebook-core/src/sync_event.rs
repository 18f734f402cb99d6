use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warn" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobEnqueued,
    JobCoalesced,
    JobClaimed,
    JobSucceeded,
    JobRetryScheduled,
    JobAttemptFailed,
    JobDead,
    JobFailed,
    JobCancelled,
    JobRescheduled,
    WebhookRejected,
    WebhookMalformed,
    WebhookIgnored,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobEnqueued => "job_enqueued",
            EventType::JobCoalesced => "job_coalesced",
            EventType::JobClaimed => "job_claimed",
            EventType::JobSucceeded => "job_succeeded",
            EventType::JobRetryScheduled => "job_retry_scheduled",
            EventType::JobAttemptFailed => "job_attempt_failed",
            EventType::JobDead => "job_dead",
            EventType::JobFailed => "job_failed",
            EventType::JobCancelled => "job_cancelled",
            EventType::JobRescheduled => "job_rescheduled",
            EventType::WebhookRejected => "webhook_rejected",
            EventType::WebhookMalformed => "webhook_malformed",
            EventType::WebhookIgnored => "webhook_ignored",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "job_enqueued" => Some(EventType::JobEnqueued),
            "job_coalesced" => Some(EventType::JobCoalesced),
            "job_claimed" => Some(EventType::JobClaimed),
            "job_succeeded" => Some(EventType::JobSucceeded),
            "job_retry_scheduled" => Some(EventType::JobRetryScheduled),
            "job_attempt_failed" => Some(EventType::JobAttemptFailed),
            "job_dead" => Some(EventType::JobDead),
            "job_failed" => Some(EventType::JobFailed),
            "job_cancelled" => Some(EventType::JobCancelled),
            "job_rescheduled" => Some(EventType::JobRescheduled),
            "webhook_rejected" => Some(EventType::WebhookRejected),
            "webhook_malformed" => Some(EventType::WebhookMalformed),
            "webhook_ignored" => Some(EventType::WebhookIgnored),
            _ => None,
        }
    }

    /// Severity each event type is recorded with.
    pub fn severity(&self) -> Severity {
        match self {
            EventType::JobRetryScheduled
            | EventType::JobAttemptFailed
            | EventType::WebhookMalformed => Severity::Warn,
            EventType::JobDead | EventType::JobFailed | EventType::WebhookRejected => {
                Severity::Error
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    pub job_id: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSyncEvent {
    pub job_id: Option<String>,
    pub event_type: EventType,
    pub message: String,
}

impl NewSyncEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            job_id: None,
            event_type,
            message: message.into(),
        }
    }

    pub fn for_job(job_id: &str, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            event_type,
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.event_type.severity()
    }
}

/// Event counts per severity since `since`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub since: Option<DateTime<Utc>>,
    pub info: i64,
    pub warn: i64,
    pub error: i64,
}

impl SeveritySummary {
    pub fn add(&mut self, severity: Severity, count: i64) {
        match severity {
            Severity::Info => self.info += count,
            Severity::Warn => self.warn += count,
            Severity::Error => self.error += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.info + self.warn + self.error
    }
}
