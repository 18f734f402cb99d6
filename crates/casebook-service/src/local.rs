use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use casebook_core::attachment::{
    normalize_mime, validate_digest, validate_file_name, Attachment, AttachmentRef,
    AttachmentStatus, RegisterAttachment,
};
use casebook_core::sync_event::SyncEvent;
use casebook_core::sync_job::{
    EnqueueOutcome, JobPayload, JobStatus, JobType, NewSyncJob, SyncJob, TargetKey,
    DEFAULT_MAX_ATTEMPTS,
};
use casebook_core::upload_session::{
    normalize_session_id, SessionClaim, UploadSession, DEFAULT_SESSION_TTL_SECS,
    SESSION_CLAIM_TTL_SECS,
};
use casebook_core::work_item_link::{validate_work_item_id, CreateWorkItemLink};
use casebook_db::Database;
use casebook_store::{digest_of, ContentStore};

use crate::types::{
    AttachmentContent, DedupCheck, DeleteOptions, LinkRequest, LinkResult, SessionResult,
    SyncSummary, UploadRequest, UploadResult,
};
use crate::{ServiceError, SyncService};

const RECENT_JOBS_LIMIT: i64 = 20;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub session_ttl: chrono::Duration,
    pub max_attempts: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            session_ttl: chrono::Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Service backed by the shared database and content store.
pub struct LocalSyncService {
    db: Arc<dyn Database>,
    content: Arc<ContentStore>,
    config: ServiceConfig,
    wake: Option<Arc<Notify>>,
}

impl LocalSyncService {
    pub fn new(db: Arc<dyn Database>, content: Arc<ContentStore>) -> Self {
        Self {
            db,
            content,
            config: ServiceConfig::default(),
            wake: None,
        }
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Workers waiting on `notify` are woken whenever a job is queued or
    /// rescheduled.
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn wake_workers(&self) {
        if let Some(notify) = &self.wake {
            notify.notify_one();
        }
    }

    async fn enqueue(&self, job: NewSyncJob) -> Result<EnqueueOutcome, ServiceError> {
        let outcome = self
            .db
            .enqueue_job(&job.with_max_attempts(self.config.max_attempts))
            .await?;
        if outcome.coalesced {
            debug!(job_id = %outcome.job.id, "coalesced into pending job");
        } else {
            info!(
                job_id = %outcome.job.id,
                job_type = %outcome.job.job_type,
                target = %outcome.job.target_key,
                "job enqueued"
            );
        }
        self.wake_workers();
        Ok(outcome)
    }

    /// Session replay: returns the stored result without writing anything.
    async fn replay_session(
        &self,
        session: &UploadSession,
        input: &UploadRequest,
        digest: &str,
    ) -> Result<UploadResult, ServiceError> {
        let session_id = session.session_id.as_str();
        let Some(attachment_id) = session.attachment_id.as_deref() else {
            return Err(ServiceError::Conflict(format!(
                "upload session {session_id} is still in progress"
            )));
        };
        let attachment = self.db.get_attachment(attachment_id).await?;
        if attachment.digest != digest {
            return Err(ServiceError::Conflict(format!(
                "upload session {session_id} already resolved to different content"
            )));
        }
        let link = match input.work_item_id {
            Some(work_item_id) => match self.db.get_link(&attachment.id, work_item_id).await {
                Ok(link) => Some(link),
                Err(casebook_db::DbError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        debug!(session_id, attachment_id = %attachment.id, "upload session replayed");
        Ok(UploadResult {
            attachment,
            deduplicated: false,
            replayed: true,
            link,
            jobs: Vec::new(),
        })
    }

    /// Run an upload under a claimed session: release the claim on failure,
    /// record the result on success.
    async fn upload_in_session(
        &self,
        session_id: &str,
        input: &UploadRequest,
        digest: &str,
        data: bytes::Bytes,
    ) -> Result<UploadResult, ServiceError> {
        let result = match self.store_and_link(input, digest, data).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(release) = self.db.release_upload_session(session_id).await {
                    warn!(session_id, error = %release, "failed to release upload session");
                }
                return Err(e);
            }
        };

        let session = self
            .db
            .complete_upload_session(
                session_id,
                &result.attachment.id,
                Utc::now(),
                self.config.session_ttl,
            )
            .await?;
        if session.attachment_id.as_deref() != Some(result.attachment.id.as_str()) {
            warn!(session_id, "upload session was resolved concurrently by another request");
            return Err(ServiceError::Conflict(format!(
                "upload session {session_id} already resolved to different content"
            )));
        }
        Ok(result)
    }

    async fn store_and_link(
        &self,
        input: &UploadRequest,
        digest: &str,
        data: bytes::Bytes,
    ) -> Result<UploadResult, ServiceError> {
        let (attachment, deduplicated, upload_job) =
            self.store_content(input, digest, data).await?;
        let mut jobs: Vec<SyncJob> = upload_job.into_iter().collect();

        let mut link = None;
        if let Some(work_item_id) = input.work_item_id {
            let created = self
                .db
                .link_attachment(&CreateWorkItemLink {
                    attachment_id: attachment.id.clone(),
                    work_item_id,
                    comment: input.comment.clone().unwrap_or_default(),
                })
                .await?;
            let outcome = self
                .enqueue(
                    NewSyncJob::new(
                        JobType::Link,
                        TargetKey::link(&attachment.id, work_item_id),
                    )
                    .with_payload(JobPayload {
                        source: Some("upload".into()),
                        ..Default::default()
                    }),
                )
                .await?;
            jobs.push(outcome.job);
            link = Some(created);
        }

        Ok(UploadResult {
            attachment,
            deduplicated,
            replayed: false,
            link,
            jobs,
        })
    }

    /// Find or create the attachment for `data`. Returns the attachment,
    /// whether it already existed, and the UPLOAD job if this call created it.
    async fn store_content(
        &self,
        input: &UploadRequest,
        digest: &str,
        data: bytes::Bytes,
    ) -> Result<(Attachment, bool, Option<SyncJob>), ServiceError> {
        let _guard = self.content.lock(digest).await;

        if let Some(existing) = self.db.find_attachment_by_digest(digest).await? {
            debug!(attachment_id = %existing.id, "content already registered");
            return Ok((existing, true, None));
        }

        // Blob first: no registry row may point at content that failed to store.
        let blob = self.content.put_verified(digest, data).await?;
        let new_attachment = RegisterAttachment {
            digest: blob.digest,
            size_bytes: blob.size_bytes,
            mime_type: normalize_mime(input.mime_type.as_deref()),
            file_name: input.file_name.trim().to_string(),
            remote_attachment_id: None,
            remote_url: None,
        };
        new_attachment.validate()?;
        let registration = self.db.register_attachment(&new_attachment).await?;
        let attachment = registration.attachment;

        if !registration.created {
            // Another process registered the digest between our check and insert.
            return Ok((attachment, true, None));
        }

        info!(
            attachment_id = %attachment.id,
            size = attachment.size_bytes,
            "attachment registered"
        );
        let job = self
            .enqueue(
                NewSyncJob::new(JobType::Upload, TargetKey::attachment(&attachment.id))
                    .with_payload(JobPayload {
                        source: Some("upload".into()),
                        ..Default::default()
                    })
                    .with_message(format!("upload {} to remote", attachment.file_name)),
            )
            .await?;
        Ok((attachment, false, Some(job.job)))
    }
}

#[async_trait]
impl SyncService for LocalSyncService {
    async fn upload(&self, input: &UploadRequest) -> Result<UploadResult, ServiceError> {
        validate_file_name(&input.file_name)?;
        if let Some(work_item_id) = input.work_item_id {
            validate_work_item_id(work_item_id)?;
        }
        let session_id = input
            .session_id
            .as_deref()
            .map(normalize_session_id)
            .transpose()?;
        let data = input.decode_content()?;
        let digest = digest_of(&data);

        let Some(session_id) = session_id else {
            return self.store_and_link(input, &digest, data).await;
        };
        let claim = self
            .db
            .claim_upload_session(
                &session_id,
                Utc::now(),
                chrono::Duration::seconds(SESSION_CLAIM_TTL_SECS),
            )
            .await?;
        match claim {
            SessionClaim::Existing(session) => self.replay_session(&session, input, &digest).await,
            SessionClaim::Claimed => {
                self.upload_in_session(&session_id, input, &digest, data)
                    .await
            }
        }
    }

    async fn link_attachment(&self, input: &LinkRequest) -> Result<LinkResult, ServiceError> {
        validate_work_item_id(input.work_item_id)?;
        let attachment = self.db.get_attachment(&input.attachment_id).await?;
        let link = self
            .db
            .link_attachment(&CreateWorkItemLink {
                attachment_id: attachment.id.clone(),
                work_item_id: input.work_item_id,
                comment: input.comment.clone().unwrap_or_default(),
            })
            .await?;
        let outcome = self
            .enqueue(
                NewSyncJob::new(
                    JobType::Link,
                    TargetKey::link(&attachment.id, input.work_item_id),
                )
                .with_payload(JobPayload {
                    source: Some("api".into()),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(LinkResult {
            link,
            job: outcome.job,
        })
    }

    async fn delete_attachment(
        &self,
        attachment_id: &str,
        options: &DeleteOptions,
    ) -> Result<SyncJob, ServiceError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        let links = self.db.list_links_for_attachment(&attachment.id).await?;
        if !links.is_empty() && !options.force {
            return Err(ServiceError::Conflict(format!(
                "attachment {} is linked to {} work item(s)",
                attachment.id,
                links.len()
            )));
        }
        let outcome = self
            .enqueue(
                NewSyncJob::new(JobType::Delete, TargetKey::attachment(&attachment.id))
                    .with_payload(JobPayload {
                        force: options.force,
                        delete_remote_blob: options.delete_remote,
                        source: Some("api".into()),
                    })
                    .with_message(format!(
                        "delete {} ({} link(s))",
                        attachment.file_name,
                        links.len()
                    )),
            )
            .await?;
        Ok(outcome.job)
    }

    async fn force_sync(&self, attachment_id: &str) -> Result<Vec<SyncJob>, ServiceError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        let target = TargetKey::attachment(&attachment.id);
        let mut jobs = self
            .db
            .reschedule_jobs(&target.lock_key(), Utc::now())
            .await?;

        if jobs.is_empty() && !attachment.is_uploaded() {
            let in_flight = self
                .db
                .list_jobs_for_attachment(&attachment.id, RECENT_JOBS_LIMIT)
                .await?
                .into_iter()
                .any(|j| j.job_type == JobType::Upload && j.status == JobStatus::InProgress);
            if !in_flight {
                let outcome = self
                    .enqueue(
                        NewSyncJob::new(JobType::Upload, target)
                            .with_payload(JobPayload {
                                source: Some("force-sync".into()),
                                ..Default::default()
                            })
                            .with_message(format!("force upload of {}", attachment.file_name)),
                    )
                    .await?;
                jobs.push(outcome.job);
            }
        } else if !jobs.is_empty() {
            info!(attachment_id, count = jobs.len(), "pending jobs rescheduled");
            self.wake_workers();
        }
        Ok(jobs)
    }

    async fn request_download(&self, attachment_id: &str) -> Result<SyncJob, ServiceError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        if attachment.remote_url.is_none() {
            return Err(ServiceError::Validation(format!(
                "attachment {} has not been uploaded to the remote yet",
                attachment.id
            )));
        }
        let outcome = self
            .enqueue(
                NewSyncJob::new(JobType::Download, TargetKey::attachment(&attachment.id))
                    .with_payload(JobPayload {
                        source: Some("api".into()),
                        ..Default::default()
                    }),
            )
            .await?;
        Ok(outcome.job)
    }

    async fn list_attachments(&self, work_item_id: i64) -> Result<Vec<AttachmentRef>, ServiceError> {
        validate_work_item_id(work_item_id)?;
        Ok(self.db.list_links_for_work_item(work_item_id).await?)
    }

    async fn get_status(&self, attachment_id: &str) -> Result<AttachmentStatus, ServiceError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        let links = self.db.list_links_for_attachment(&attachment.id).await?;
        let recent_jobs = self
            .db
            .list_jobs_for_attachment(&attachment.id, RECENT_JOBS_LIMIT)
            .await?;
        Ok(AttachmentStatus {
            attachment,
            links,
            recent_jobs,
        })
    }

    async fn check_duplicate(&self, digest: &str) -> Result<DedupCheck, ServiceError> {
        let digest = digest.trim().to_ascii_lowercase();
        validate_digest(&digest)?;
        let attachment = self.db.find_attachment_by_digest(&digest).await?;
        Ok(DedupCheck {
            exists: attachment.is_some(),
            digest,
            attachment,
        })
    }

    async fn resolve_upload_session(
        &self,
        session_id: &str,
    ) -> Result<SessionResult, ServiceError> {
        let session_id = normalize_session_id(session_id)?;
        let session = self
            .db
            .get_upload_session(&session_id)
            .await?
            .filter(|s| !s.is_expired(Utc::now()))
            .ok_or_else(|| ServiceError::NotFound(format!("upload session {session_id}")))?;
        let attachment_id = session
            .attachment_id
            .clone()
            .ok_or_else(|| ServiceError::NotFound(format!("upload session {session_id}")))?;
        let attachment = self.db.get_attachment(&attachment_id).await?;
        Ok(SessionResult {
            session,
            attachment,
        })
    }

    async fn get_attachment_content(
        &self,
        attachment_id: &str,
    ) -> Result<AttachmentContent, ServiceError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        // A registered attachment without its blob is a storage fault, not a 404.
        let data = self
            .content
            .get_opt(&attachment.digest)
            .await?
            .ok_or_else(|| {
                ServiceError::Storage(format!("content of attachment {} is missing", attachment.id))
            })?;
        Ok(AttachmentContent { attachment, data })
    }

    async fn get_job(&self, job_id: &str) -> Result<SyncJob, ServiceError> {
        Ok(self.db.get_job(job_id).await?)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<SyncJob, ServiceError> {
        let job = self.db.cancel_job(job_id).await?;
        info!(job_id, job_type = %job.job_type, "job cancelled");
        Ok(job)
    }

    async fn list_dead_jobs(&self, limit: i64) -> Result<Vec<SyncJob>, ServiceError> {
        Ok(self
            .db
            .list_jobs_by_status(JobStatus::Dead, limit.clamp(1, 1000))
            .await?)
    }

    async fn summary(&self, window_secs: i64) -> Result<SyncSummary, ServiceError> {
        if window_secs <= 0 {
            return Err(ServiceError::Validation(
                "window must be a positive number of seconds".into(),
            ));
        }
        let since = Utc::now() - chrono::Duration::seconds(window_secs);
        let events = self.db.summarize_events(since).await?;
        let jobs = self.db.count_jobs_by_status().await?;
        Ok(SyncSummary {
            window_secs,
            events,
            jobs,
        })
    }

    async fn list_events(
        &self,
        job_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, ServiceError> {
        Ok(self.db.list_events(job_id, limit.clamp(1, 1000)).await?)
    }
}
