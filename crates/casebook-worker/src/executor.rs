use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use casebook_core::attachment::{Attachment, RegisterAttachment, DEFAULT_MIME_TYPE};
use casebook_core::sync_job::{JobType, SyncJob};
use casebook_core::work_item_link::CreateWorkItemLink;
use casebook_core::SyncError;
use casebook_db::{Database, DbError};
use casebook_remote::{RemoteRelation, RemoteTracker};
use casebook_store::{digest_of, ContentStore, StoreError};

fn store_err(e: StoreError) -> SyncError {
    match e {
        StoreError::NotFound(key) => SyncError::NotFound(format!("blob {key}")),
        StoreError::Internal(msg) => SyncError::Storage(msg),
    }
}

/// Carries out one claimed job against the remote tracker. Returns the
/// message recorded on the success event.
pub struct JobExecutor {
    db: Arc<dyn Database>,
    content: Arc<ContentStore>,
    remote: Arc<dyn RemoteTracker>,
}

impl JobExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        content: Arc<ContentStore>,
        remote: Arc<dyn RemoteTracker>,
    ) -> Self {
        Self { db, content, remote }
    }

    pub async fn execute(&self, job: &SyncJob) -> Result<String, SyncError> {
        match job.job_type {
            JobType::Upload => self.upload(job).await,
            JobType::Link => self.link(job).await,
            JobType::Download => match (&job.attachment_id, job.work_item_id) {
                (Some(attachment_id), _) => self.download_attachment(attachment_id).await,
                (None, Some(work_item_id)) => self.reconcile_work_item(work_item_id).await,
                (None, None) => Err(SyncError::Validation(format!(
                    "download job {} has no target",
                    job.id
                ))),
            },
            JobType::Delete => self.delete(job).await,
        }
    }

    fn attachment_id<'a>(&self, job: &'a SyncJob) -> Result<&'a str, SyncError> {
        job.attachment_id.as_deref().ok_or_else(|| {
            SyncError::Validation(format!("{} job {} has no attachment", job.job_type, job.id))
        })
    }

    /// Push the blob unless the attachment already has a remote identity.
    async fn ensure_uploaded(&self, attachment: Attachment) -> Result<(Attachment, bool), SyncError> {
        if attachment.is_uploaded() {
            return Ok((attachment, false));
        }
        let data = self.content.get(&attachment.digest).await.map_err(store_err)?;
        let uploaded = self
            .remote
            .upload_attachment(&attachment.file_name, data)
            .await?;
        let updated = self
            .db
            .set_remote_reference(&attachment.id, &uploaded.id, &uploaded.url)
            .await?;
        Ok((updated, true))
    }

    async fn upload(&self, job: &SyncJob) -> Result<String, SyncError> {
        let attachment = self.db.get_attachment(self.attachment_id(job)?).await?;
        let (attachment, pushed) = self.ensure_uploaded(attachment).await?;
        let remote_id = attachment.remote_attachment_id.unwrap_or_default();
        if pushed {
            Ok(format!("uploaded {} as {remote_id}", attachment.file_name))
        } else {
            Ok(format!("{} already uploaded as {remote_id}", attachment.file_name))
        }
    }

    async fn link(&self, job: &SyncJob) -> Result<String, SyncError> {
        let attachment_id = self.attachment_id(job)?;
        let work_item_id = job.work_item_id.ok_or_else(|| {
            SyncError::Validation(format!("link job {} has no work item", job.id))
        })?;

        let link = match self.db.get_link(attachment_id, work_item_id).await {
            Ok(link) => link,
            Err(DbError::NotFound(_)) => {
                return Ok(format!(
                    "link to work item {work_item_id} was removed locally; nothing to do"
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let attachment = self.db.get_attachment(attachment_id).await?;
        let (attachment, _) = self.ensure_uploaded(attachment).await?;
        let url = attachment.remote_url.as_deref().ok_or_else(|| {
            SyncError::Internal(format!("attachment {} uploaded without url", attachment.id))
        })?;

        let created = self
            .remote
            .link_attachment(work_item_id, url, &link.comment)
            .await?;
        if created {
            Ok(format!("linked {} to work item {work_item_id}", attachment.file_name))
        } else {
            Ok(format!(
                "{} already linked to work item {work_item_id}",
                attachment.file_name
            ))
        }
    }

    /// Re-fetch a known attachment's bytes from the remote into the
    /// content store.
    async fn download_attachment(&self, attachment_id: &str) -> Result<String, SyncError> {
        let attachment = self.db.get_attachment(attachment_id).await?;
        let url = attachment.remote_url.as_deref().ok_or_else(|| {
            SyncError::Validation(format!("attachment {attachment_id} has no remote url"))
        })?;

        let data = self.remote.download_attachment(url).await?;
        let digest = digest_of(&data);
        if digest != attachment.digest {
            return Err(SyncError::Conflict(format!(
                "remote content of {attachment_id} hashes to {digest}, expected {}",
                attachment.digest
            )));
        }

        let _guard = self.content.lock(&attachment.digest).await;
        let blob = self.content.put(data).await.map_err(store_err)?;
        if blob.written {
            Ok(format!("restored {} from remote", attachment.file_name))
        } else {
            Ok(format!("{} already stored locally", attachment.file_name))
        }
    }

    /// Import every remote attachment of `work_item_id` that is missing
    /// locally, and record missing links for ones that are known.
    async fn reconcile_work_item(&self, work_item_id: i64) -> Result<String, SyncError> {
        let relations = self.remote.list_attachments(work_item_id).await?;
        let mut imported = 0;
        let mut linked = 0;

        for relation in &relations {
            let Some(remote_id) = relation.remote_id() else {
                warn!(work_item_id, url = %relation.url, "skipping relation without attachment id");
                continue;
            };

            let attachment = match self.db.find_attachment_by_remote_id(&remote_id).await? {
                Some(existing) => existing,
                None => {
                    let (attachment, created) = self.import(relation, &remote_id).await?;
                    if created {
                        imported += 1;
                    }
                    attachment
                }
            };

            match self.db.get_link(&attachment.id, work_item_id).await {
                Ok(_) => {}
                Err(DbError::NotFound(_)) => {
                    self.db
                        .link_attachment(&CreateWorkItemLink {
                            attachment_id: attachment.id.clone(),
                            work_item_id,
                            comment: relation.comment.clone().unwrap_or_default(),
                        })
                        .await?;
                    linked += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(work_item_id, remote = relations.len(), imported, linked, "work item reconciled");
        Ok(format!(
            "reconciled work item {work_item_id}: {} remote attachment(s), {imported} imported, {linked} linked",
            relations.len()
        ))
    }

    /// Download a remote attachment and register it, reusing an existing
    /// row when the same content is already known.
    async fn import(
        &self,
        relation: &RemoteRelation,
        remote_id: &str,
    ) -> Result<(Attachment, bool), SyncError> {
        let data: Bytes = self.remote.download_attachment(&relation.url).await?;
        let digest = digest_of(&data);
        let _guard = self.content.lock(&digest).await;

        if let Some(existing) = self.db.find_attachment_by_digest(&digest).await? {
            debug!(attachment_id = %existing.id, remote_id, "remote content already known");
            if existing.remote_attachment_id.is_some() {
                return Ok((existing, false));
            }
            // Adopt the remote copy so a pending UPLOAD does not push it again.
            let adopted = self
                .db
                .set_remote_reference(&existing.id, remote_id, &relation.url)
                .await?;
            info!(attachment_id = %adopted.id, remote_id, "adopted remote copy of local attachment");
            return Ok((adopted, false));
        }

        let blob = self.content.put(data).await.map_err(store_err)?;
        let file_name = relation
            .name
            .clone()
            .filter(|n| casebook_core::attachment::validate_file_name(n).is_ok())
            .unwrap_or_else(|| format!("attachment-{remote_id}"));
        let new_attachment = RegisterAttachment {
            digest: blob.digest,
            size_bytes: blob.size_bytes,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            file_name,
            remote_attachment_id: Some(remote_id.to_string()),
            remote_url: Some(relation.url.clone()),
        };
        new_attachment.validate()?;
        let registration = self.db.register_attachment(&new_attachment).await?;
        Ok((registration.attachment, registration.created))
    }

    async fn delete(&self, job: &SyncJob) -> Result<String, SyncError> {
        let attachment_id = self.attachment_id(job)?;
        let attachment = match self.db.get_attachment(attachment_id).await {
            Ok(a) => a,
            Err(DbError::NotFound(_)) => {
                return Ok(format!("attachment {attachment_id} already deleted"))
            }
            Err(e) => return Err(e.into()),
        };

        let links = self.db.list_links_for_attachment(&attachment.id).await?;
        if !links.is_empty() && !job.payload.force {
            return Err(SyncError::Conflict(format!(
                "attachment {} is linked to {} work item(s)",
                attachment.id,
                links.len()
            )));
        }

        if let Some(url) = attachment.remote_url.as_deref() {
            for link in &links {
                self.remote.unlink_attachment(link.work_item_id, url).await?;
            }
        }
        if job.payload.delete_remote_blob {
            if let Some(remote_id) = attachment.remote_attachment_id.as_deref() {
                self.remote.delete_attachment(remote_id).await?;
            }
        }

        let _guard = self.content.lock(&attachment.digest).await;
        self.db.delete_attachment(&attachment.id, job.payload.force).await?;
        if self
            .db
            .find_attachment_by_digest(&attachment.digest)
            .await?
            .is_none()
        {
            self.content
                .delete(&attachment.digest)
                .await
                .map_err(store_err)?;
        }

        Ok(format!(
            "deleted {} and {} link(s)",
            attachment.file_name,
            links.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::sync_job::{NewSyncJob, TargetKey};
    use casebook_db::SqliteDatabase;
    use casebook_remote::{MockOp, MockTracker};
    use casebook_store::{LocalStore, ObjectStore, StoreConfig};

    async fn setup() -> (
        tempfile::TempDir,
        Arc<dyn Database>,
        Arc<ContentStore>,
        Arc<MockTracker>,
        JobExecutor,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(&StoreConfig::local(
            tmp.path().to_string_lossy(),
        )));
        let content = Arc::new(ContentStore::new(objects));
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let remote = Arc::new(MockTracker::new());
        let executor = JobExecutor::new(db.clone(), content.clone(), remote.clone());
        (tmp, db, content, remote, executor)
    }

    async fn register(db: &Arc<dyn Database>, content: &ContentStore, data: &'static [u8]) -> Attachment {
        let blob = content.put(Bytes::from_static(data)).await.unwrap();
        db.register_attachment(&RegisterAttachment {
            digest: blob.digest,
            size_bytes: blob.size_bytes,
            mime_type: "text/plain".into(),
            file_name: "notes.txt".into(),
            remote_attachment_id: None,
            remote_url: None,
        })
        .await
        .unwrap()
        .attachment
    }

    async fn job(db: &Arc<dyn Database>, job_type: JobType, target: TargetKey) -> SyncJob {
        db.enqueue_job(&NewSyncJob::new(job_type, target))
            .await
            .unwrap()
            .job
    }

    #[tokio::test]
    async fn upload_is_skipped_once_uploaded() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"upload me").await;
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&attachment.id)).await;

        let msg = executor.execute(&upload).await.unwrap();
        assert!(msg.starts_with("uploaded"));
        let msg = executor.execute(&upload).await.unwrap();
        assert!(msg.contains("already uploaded"));
        assert_eq!(remote.calls(MockOp::Upload), 1);

        let stored = db.get_attachment(&attachment.id).await.unwrap();
        assert!(stored.is_uploaded());
    }

    #[tokio::test]
    async fn link_uploads_first_when_needed() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"link me").await;
        db.link_attachment(&CreateWorkItemLink {
            attachment_id: attachment.id.clone(),
            work_item_id: 42,
            comment: "repro".into(),
        })
        .await
        .unwrap();
        let link = job(&db, JobType::Link, TargetKey::link(&attachment.id, 42)).await;

        executor.execute(&link).await.unwrap();
        let relations = remote.relations(42);
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].comment.as_deref(), Some("repro"));

        let msg = executor.execute(&link).await.unwrap();
        assert!(msg.contains("already linked"));
        assert_eq!(remote.calls(MockOp::Upload), 1);
    }

    #[tokio::test]
    async fn link_removed_locally_is_a_noop() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"gone").await;
        let link = job(&db, JobType::Link, TargetKey::link(&attachment.id, 9)).await;

        let msg = executor.execute(&link).await.unwrap();
        assert!(msg.contains("nothing to do"));
        assert_eq!(remote.calls(MockOp::Link), 0);
    }

    #[tokio::test]
    async fn remote_errors_keep_their_class() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"flaky").await;
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&attachment.id)).await;

        remote.fail_always(MockOp::Upload, 503);
        assert!(executor.execute(&upload).await.unwrap_err().is_retryable());

        remote.fail_always(MockOp::Upload, 401);
        let err = executor.execute(&upload).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn missing_blob_is_not_retried() {
        let (_tmp, db, content, _remote, executor) = setup().await;
        let attachment = register(&db, &content, b"vanishing").await;
        content.delete(&attachment.digest).await.unwrap();
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&attachment.id)).await;

        let err = executor.execute(&upload).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn download_restores_local_blob_and_checks_digest() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"round trip").await;
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&attachment.id)).await;
        executor.execute(&upload).await.unwrap();

        content.delete(&attachment.digest).await.unwrap();
        let download = job(&db, JobType::Download, TargetKey::attachment(&attachment.id)).await;
        let msg = executor.execute(&download).await.unwrap();
        assert!(msg.starts_with("restored"));
        assert!(content.contains(&attachment.digest).await.unwrap());

        // Remote content that no longer matches the recorded digest.
        let other = remote.seed_attachment(1, "other.txt", "different");
        db.delete_attachment(&attachment.id, true).await.unwrap();
        let forged = db
            .register_attachment(&RegisterAttachment {
                digest: attachment.digest.clone(),
                size_bytes: 10,
                mime_type: "text/plain".into(),
                file_name: "forged.txt".into(),
                remote_attachment_id: other.remote_id(),
                remote_url: Some(other.url.clone()),
            })
            .await
            .unwrap()
            .attachment;
        let download = job(&db, JobType::Download, TargetKey::attachment(&forged.id)).await;
        let err = executor.execute(&download).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));
    }

    #[tokio::test]
    async fn reconcile_imports_missing_and_links_known() {
        let (_tmp, db, content, remote, executor) = setup().await;
        // Known locally and already uploaded, but not linked to 42 yet.
        let known = register(&db, &content, b"known").await;
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&known.id)).await;
        executor.execute(&upload).await.unwrap();
        let known = db.get_attachment(&known.id).await.unwrap();
        remote
            .link_attachment(42, known.remote_url.as_deref().unwrap(), "")
            .await
            .unwrap();
        // Created directly in the remote UI.
        remote.seed_attachment(42, "browser.har", "har data");

        let reconcile = job(&db, JobType::Download, TargetKey::work_item(42)).await;
        let msg = executor.execute(&reconcile).await.unwrap();
        assert!(msg.contains("2 remote attachment(s), 1 imported, 2 linked"), "{msg}");

        let refs = db.list_links_for_work_item(42).await.unwrap();
        assert_eq!(refs.len(), 2);
        let imported = refs
            .iter()
            .find(|r| r.attachment.file_name == "browser.har")
            .unwrap();
        assert!(imported.attachment.is_uploaded());
        assert!(content.contains(&imported.attachment.digest).await.unwrap());

        // Second pass changes nothing.
        let msg = executor.execute(&reconcile).await.unwrap();
        assert!(msg.contains("0 imported, 0 linked"), "{msg}");
    }

    #[tokio::test]
    async fn reconcile_adopts_remote_copy_of_pending_upload() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let local = register(&db, &content, b"same bytes").await;
        let upload = job(&db, JobType::Upload, TargetKey::attachment(&local.id)).await;
        let seeded = remote.seed_attachment(42, "same.txt", "same bytes");

        let reconcile = job(&db, JobType::Download, TargetKey::work_item(42)).await;
        let msg = executor.execute(&reconcile).await.unwrap();
        assert!(msg.contains("0 imported, 1 linked"), "{msg}");
        executor.execute(&reconcile).await.unwrap();
        assert_eq!(remote.calls(MockOp::Download), 1);

        let adopted = db.get_attachment(&local.id).await.unwrap();
        assert_eq!(adopted.remote_attachment_id, seeded.remote_id());
        assert_eq!(adopted.remote_url.as_deref(), Some(seeded.url.as_str()));

        let msg = executor.execute(&upload).await.unwrap();
        assert!(msg.contains("already uploaded"), "{msg}");
        assert_eq!(remote.calls(MockOp::Upload), 0);
        assert_eq!(remote.blob_count(), 1);
    }

    #[tokio::test]
    async fn reconcile_replaces_unusable_remote_names() {
        let (_tmp, db, _content, remote, executor) = setup().await;
        let seeded = remote.seed_attachment(42, "line\nbreak.txt", "odd name");

        let reconcile = job(&db, JobType::Download, TargetKey::work_item(42)).await;
        let msg = executor.execute(&reconcile).await.unwrap();
        assert!(msg.contains("1 imported"), "{msg}");

        let refs = db.list_links_for_work_item(42).await.unwrap();
        assert_eq!(refs.len(), 1);
        let remote_id = seeded.remote_id().unwrap();
        assert_eq!(refs[0].attachment.file_name, format!("attachment-{remote_id}"));
    }

    #[tokio::test]
    async fn delete_cascades_locally_and_remotely() {
        let (_tmp, db, content, remote, executor) = setup().await;
        let attachment = register(&db, &content, b"doomed").await;
        let bystander = register(&db, &content, b"bystander").await;
        for wid in [1, 2] {
            db.link_attachment(&CreateWorkItemLink {
                attachment_id: attachment.id.clone(),
                work_item_id: wid,
                comment: String::new(),
            })
            .await
            .unwrap();
            executor
                .execute(&job(&db, JobType::Link, TargetKey::link(&attachment.id, wid)).await)
                .await
                .unwrap();
        }
        let remote_id = db
            .get_attachment(&attachment.id)
            .await
            .unwrap()
            .remote_attachment_id
            .unwrap();

        let mut delete = job(&db, JobType::Delete, TargetKey::attachment(&attachment.id)).await;
        let err = executor.execute(&delete).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        delete.payload.force = true;
        delete.payload.delete_remote_blob = true;
        let msg = executor.execute(&delete).await.unwrap();
        assert_eq!(msg, "deleted notes.txt and 2 link(s)");

        assert!(matches!(
            db.get_attachment(&attachment.id).await,
            Err(DbError::NotFound(_))
        ));
        assert!(remote.relations(1).is_empty());
        assert!(remote.relations(2).is_empty());
        assert!(!remote.has_blob(&remote_id));
        assert!(!content.contains(&attachment.digest).await.unwrap());

        assert!(db.get_attachment(&bystander.id).await.is_ok());
        assert!(content.contains(&bystander.digest).await.unwrap());

        let msg = executor.execute(&delete).await.unwrap();
        assert!(msg.contains("already deleted"));
    }
}
