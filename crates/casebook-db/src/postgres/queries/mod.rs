pub mod attachments;
pub mod events;
pub mod jobs;
pub mod links;
pub mod sessions;
