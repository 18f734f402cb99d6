//! Parsing of inbound work-item change notifications.
//!
//! The remote system posts service-hook notifications shaped like
//! `{"eventType": "workitem.updated", "resource": {...}}`. Only the event
//! type and the affected work-item id matter to the sync engine.

use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;

/// Event types that can add or change attachments on a work item.
pub const RECONCILE_EVENT_TYPES: &[&str] = &[
    "workitem.created",
    "workitem.updated",
    "workitem.restored",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum NotificationAction {
    /// Download and reconcile attachments of this work item.
    Reconcile { work_item_id: i64 },
    /// Well-formed but irrelevant to attachments.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemNotification {
    pub event_type: String,
    pub action: NotificationAction,
}

pub fn parse_notification(raw: &[u8]) -> Result<WorkItemNotification, SyncError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| SyncError::Validation(format!("body is not JSON: {e}")))?;

    let event_type = value
        .get("eventType")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SyncError::Validation("missing eventType".into()))?
        .to_string();

    if !RECONCILE_EVENT_TYPES.contains(&event_type.as_str()) {
        return Ok(WorkItemNotification {
            event_type,
            action: NotificationAction::Ignore,
        });
    }

    let resource = value
        .get("resource")
        .filter(|r| r.is_object())
        .ok_or_else(|| SyncError::Validation("missing resource object".into()))?;

    let work_item_id = work_item_id_of(&event_type, resource).ok_or_else(|| {
        SyncError::Validation(format!("{event_type}: no work item id in resource"))
    })?;

    Ok(WorkItemNotification {
        event_type,
        action: NotificationAction::Reconcile { work_item_id },
    })
}

/// Updates carry the work item in `workItemId` (their own `id` is the update
/// number); created/restored events carry it in `id`.
fn work_item_id_of(event_type: &str, resource: &Value) -> Option<i64> {
    let candidates: [Option<&Value>; 2] = if event_type == "workitem.updated" {
        [resource.get("workItemId"), resource.pointer("/revision/id")]
    } else {
        [resource.get("id"), resource.pointer("/revision/id")]
    };
    candidates
        .into_iter()
        .flatten()
        .find_map(as_positive_id)
}

fn as_positive_id(v: &Value) -> Option<i64> {
    let id = match v {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}
