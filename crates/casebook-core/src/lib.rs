pub mod attachment;
pub mod backoff;
pub mod error;
pub mod sync_event;
pub mod sync_job;
pub mod upload_session;
pub mod webhook;
pub mod work_item_link;

pub use attachment::Attachment;
pub use error::SyncError;
pub use sync_event::{EventType, Severity, SyncEvent};
pub use sync_job::{JobStatus, JobType, SyncJob, TargetKey};
pub use upload_session::UploadSession;
pub use work_item_link::WorkItemLink;
