use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Association between an attachment and a remote work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemLink {
    pub work_item_id: i64,
    pub attachment_id: String,
    pub comment: String,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkItemLink {
    pub attachment_id: String,
    pub work_item_id: i64,
    #[serde(default)]
    pub comment: String,
}

pub fn validate_work_item_id(id: i64) -> Result<(), SyncError> {
    if id <= 0 {
        return Err(SyncError::Validation(format!(
            "work item id must be positive, got {id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_id_must_be_positive() {
        assert!(validate_work_item_id(42).is_ok());
        assert!(validate_work_item_id(0).is_err());
        assert!(validate_work_item_id(-7).is_err());
    }
}
