mod http;
mod local;
mod traits;
pub mod types;

pub use http::{HttpService, WebhookResponse};
pub use local::{LocalSyncService, ServiceConfig};
pub use traits::{ServiceError, SyncService};
pub use types::{
    AttachmentContent, DedupCheck, DeleteOptions, JobResponse, JobsResponse, LinkRequest,
    LinkResult, SessionResult, SyncSummary, UploadRequest, UploadResult,
};
