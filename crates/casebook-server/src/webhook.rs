//! Inbound work-item notifications.
//!
//! The handler only verifies and enqueues; remote calls happen in the
//! worker. Every call records exactly one event describing the decision.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use casebook_core::sync_event::{EventType, NewSyncEvent};
use casebook_core::sync_job::{JobPayload, JobType, NewSyncJob, TargetKey};
use casebook_core::webhook::{parse_notification, NotificationAction};
use casebook_db::{Database, DbError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-casebook-signature";

/// Outcome of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDecision {
    /// Missing secret, missing or wrong signature.
    Rejected,
    /// Signed correctly but the body could not be understood.
    Malformed,
    /// Understood, but nothing to reconcile.
    Ignored,
    /// A DOWNLOAD job for the work item was queued (or already pending).
    Enqueued { job_id: String, coalesced: bool },
}

/// Compute the header value a sender would attach to `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` (`sha256=<hex>` or bare hex) against the body.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let hex_part = header.trim();
    let hex_part = hex_part.strip_prefix("sha256=").unwrap_or(hex_part);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub struct WebhookIngress {
    db: Arc<dyn Database>,
    secret: Option<String>,
    max_attempts: i32,
    wake: Arc<Notify>,
}

impl WebhookIngress {
    pub fn new(
        db: Arc<dyn Database>,
        secret: Option<String>,
        max_attempts: i32,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            secret: secret.filter(|s| !s.is_empty()),
            max_attempts,
            wake,
        }
    }

    pub async fn receive(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookDecision, DbError> {
        let reason = match (&self.secret, signature) {
            (None, _) => Some("webhook secret is not configured"),
            (Some(_), None) => Some("missing signature header"),
            (Some(secret), Some(sig)) if !verify_signature(secret, body, sig) => {
                Some("signature mismatch")
            }
            _ => None,
        };
        if let Some(reason) = reason {
            error!("webhook rejected: {reason}");
            self.db
                .append_event(&NewSyncEvent::new(
                    EventType::WebhookRejected,
                    format!("webhook rejected: {reason}"),
                ))
                .await?;
            return Ok(WebhookDecision::Rejected);
        }

        let notification = match parse_notification(body) {
            Ok(n) => n,
            Err(e) => {
                warn!("malformed webhook dropped: {e}");
                self.db
                    .append_event(&NewSyncEvent::new(
                        EventType::WebhookMalformed,
                        format!("malformed webhook dropped: {e}"),
                    ))
                    .await?;
                return Ok(WebhookDecision::Malformed);
            }
        };

        match notification.action {
            NotificationAction::Ignore => {
                info!(event_type = %notification.event_type, "webhook ignored");
                self.db
                    .append_event(&NewSyncEvent::new(
                        EventType::WebhookIgnored,
                        format!("{} does not affect attachments", notification.event_type),
                    ))
                    .await?;
                Ok(WebhookDecision::Ignored)
            }
            NotificationAction::Reconcile { work_item_id } => {
                let job = NewSyncJob::new(JobType::Download, TargetKey::work_item(work_item_id))
                    .with_payload(JobPayload {
                        source: Some(format!("webhook:{}", notification.event_type)),
                        ..Default::default()
                    })
                    .with_max_attempts(self.max_attempts)
                    .with_message(format!(
                        "reconcile work item {work_item_id} after {}",
                        notification.event_type
                    ));
                let outcome = self.db.enqueue_job(&job).await?;
                info!(
                    work_item_id,
                    job_id = %outcome.job.id,
                    coalesced = outcome.coalesced,
                    "webhook accepted"
                );
                self.wake.notify_one();
                Ok(WebhookDecision::Enqueued {
                    job_id: outcome.job.id,
                    coalesced: outcome.coalesced,
                })
            }
        }
    }
}
