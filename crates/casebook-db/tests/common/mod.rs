// Shared assertions run against every Database backend.

#![allow(dead_code)]

use chrono::{Duration, Utc};

use casebook_core::attachment::RegisterAttachment;
use casebook_core::sync_event::{EventType, NewSyncEvent, Severity};
use casebook_core::sync_job::{
    JobFailure, JobPayload, JobStatus, JobType, NewSyncJob, TargetKey,
};
use casebook_core::upload_session::SessionClaim;
use casebook_core::work_item_link::CreateWorkItemLink;
use casebook_db::{Database, DbError};

pub fn digest(n: u8) -> String {
    format!("{:02x}", n).repeat(32)
}

pub fn register(n: u8) -> RegisterAttachment {
    RegisterAttachment {
        digest: digest(n),
        size_bytes: 100 + n as i64,
        mime_type: "image/png".into(),
        file_name: format!("shot-{n}.png"),
        remote_attachment_id: None,
        remote_url: None,
    }
}

pub async fn test_register_is_idempotent_by_digest(db: &dyn Database) {
    let first = db.register_attachment(&register(1)).await.unwrap();
    assert!(first.created);
    assert!(!first.attachment.is_uploaded());

    let mut again = register(1);
    again.file_name = "other-name.png".into();
    let second = db.register_attachment(&again).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.attachment.id, first.attachment.id);
    assert_eq!(second.attachment.file_name, "shot-1.png");

    let found = db
        .find_attachment_by_digest(&digest(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.attachment.id);
    assert!(db.find_attachment_by_digest(&digest(2)).await.unwrap().is_none());
}

pub async fn test_remote_reference(db: &dyn Database) {
    let a = db.register_attachment(&register(3)).await.unwrap().attachment;
    let updated = db
        .set_remote_reference(&a.id, "remote-3", "https://remote/3")
        .await
        .unwrap();
    assert!(updated.is_uploaded());
    assert_eq!(updated.remote_url.as_deref(), Some("https://remote/3"));

    let by_remote = db
        .find_attachment_by_remote_id("remote-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_remote.id, a.id);

    let missing = db.set_remote_reference("nope", "r", "u").await.unwrap_err();
    assert!(matches!(missing, DbError::NotFound(_)));
    assert!(matches!(
        db.get_attachment("nope").await.unwrap_err(),
        DbError::NotFound(_)
    ));
}

pub async fn test_links(db: &dyn Database) {
    let a = db.register_attachment(&register(4)).await.unwrap().attachment;
    let b = db.register_attachment(&register(5)).await.unwrap().attachment;

    for (att, comment) in [(&a, "first"), (&b, "second")] {
        db.link_attachment(&CreateWorkItemLink {
            attachment_id: att.id.clone(),
            work_item_id: 42,
            comment: comment.into(),
        })
        .await
        .unwrap();
    }
    // Re-linking only updates the comment.
    let relinked = db
        .link_attachment(&CreateWorkItemLink {
            attachment_id: a.id.clone(),
            work_item_id: 42,
            comment: "updated".into(),
        })
        .await
        .unwrap();
    assert_eq!(relinked.comment, "updated");

    let refs = db.list_links_for_work_item(42).await.unwrap();
    assert_eq!(refs.len(), 2);
    assert!(refs.iter().any(|r| r.attachment.id == a.id && r.comment == "updated"));

    let links = db.list_links_for_attachment(&a.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].work_item_id, 42);

    let err = db
        .link_attachment(&CreateWorkItemLink {
            attachment_id: "missing".into(),
            work_item_id: 42,
            comment: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));
    assert!(matches!(
        db.get_link(&b.id, 7).await.unwrap_err(),
        DbError::NotFound(_)
    ));
}

pub async fn test_delete_attachment_respects_links(db: &dyn Database) {
    let a = db.register_attachment(&register(6)).await.unwrap().attachment;
    db.link_attachment(&CreateWorkItemLink {
        attachment_id: a.id.clone(),
        work_item_id: 7,
        comment: String::new(),
    })
    .await
    .unwrap();

    let err = db.delete_attachment(&a.id, false).await.unwrap_err();
    assert!(matches!(err, DbError::Conflict(_)));
    assert!(db.get_attachment(&a.id).await.is_ok());

    let deleted = db.delete_attachment(&a.id, true).await.unwrap();
    assert_eq!(deleted.id, a.id);
    assert!(db.list_links_for_work_item(7).await.unwrap().is_empty());
    assert!(db.find_attachment_by_digest(&digest(6)).await.unwrap().is_none());
}

pub async fn test_enqueue_coalesces(db: &dyn Database) {
    let first = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a1")))
        .await
        .unwrap();
    assert!(!first.coalesced);
    assert_eq!(first.job.status, JobStatus::Queued);
    assert_eq!(first.job.attempts, 0);
    assert_eq!(first.job.lock_key, "attachment:a1");

    let second = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a1")))
        .await
        .unwrap();
    assert!(second.coalesced);
    assert_eq!(second.job.id, first.job.id);

    // Deletes never coalesce.
    let d1 = db
        .enqueue_job(&NewSyncJob::new(JobType::Delete, TargetKey::attachment("a1")))
        .await
        .unwrap();
    let d2 = db
        .enqueue_job(&NewSyncJob::new(JobType::Delete, TargetKey::attachment("a1")))
        .await
        .unwrap();
    assert_ne!(d1.job.id, d2.job.id);

    let events = db.list_events(Some(&first.job.id), 10).await.unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&EventType::JobEnqueued));
    assert!(types.contains(&EventType::JobCoalesced));
}

pub async fn test_claim_lifecycle(db: &dyn Database) {
    assert!(db.claim_next_job("w1", Utc::now()).await.unwrap().is_none());

    let payload = JobPayload {
        force: true,
        ..Default::default()
    };
    let queued = db
        .enqueue_job(
            &NewSyncJob::new(JobType::Link, TargetKey::link("a2", 9)).with_payload(payload.clone()),
        )
        .await
        .unwrap()
        .job;

    let claimed = db
        .claim_next_job("w1", Utc::now())
        .await
        .unwrap()
        .expect("job should be claimable");
    assert_eq!(claimed.id, queued.id);
    assert_eq!(claimed.status, JobStatus::InProgress);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
    assert_eq!(claimed.payload, payload);

    // Nothing else is claimable.
    assert!(db.claim_next_job("w2", Utc::now()).await.unwrap().is_none());

    let done = db.complete_job(&claimed.id, "w1", "linked").await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert!(done.finished_at.is_some());

    // Terminal jobs cannot be completed again.
    let err = db.complete_job(&claimed.id, "w1", "again").await.unwrap_err();
    assert!(matches!(err, DbError::Conflict(_)));
}

pub async fn test_only_claim_holder_finishes_job(db: &dyn Database) {
    let job = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a10")))
        .await
        .unwrap()
        .job;
    let first = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    assert_eq!(first.id, job.id);
    assert!(matches!(
        db.complete_job(&job.id, "w2", "not mine").await.unwrap_err(),
        DbError::Conflict(_)
    ));

    // The lease lapses and the job is handed back, then picked up by w2.
    db.fail_job(
        &job.id,
        "w1",
        &JobFailure::Retry {
            error: "lease expired".into(),
            next_run_at: Utc::now() - Duration::seconds(1),
        },
    )
    .await
    .unwrap();
    let second = db.claim_next_job("w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(second.id, job.id);
    assert_eq!(second.claimed_by.as_deref(), Some("w2"));

    // The original worker finally finishes; its result must not land.
    assert!(matches!(
        db.complete_job(&job.id, "w1", "late").await.unwrap_err(),
        DbError::Conflict(_)
    ));
    assert!(matches!(
        db.fail_job(&job.id, "w1", &JobFailure::Fatal { error: "late".into() })
            .await
            .unwrap_err(),
        DbError::Conflict(_)
    ));
    assert_eq!(db.get_job(&job.id).await.unwrap().status, JobStatus::InProgress);

    let done = db.complete_job(&job.id, "w2", "uploaded").await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
}

pub async fn test_claim_respects_lock_key(db: &dyn Database) {
    let upload = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a3")))
        .await
        .unwrap()
        .job;
    let link = db
        .enqueue_job(&NewSyncJob::new(JobType::Link, TargetKey::link("a3", 11)))
        .await
        .unwrap()
        .job;
    let other = db
        .enqueue_job(&NewSyncJob::new(JobType::Download, TargetKey::work_item(12)))
        .await
        .unwrap()
        .job;
    assert_eq!(upload.lock_key, link.lock_key);

    let first = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    assert_eq!(first.id, upload.id);
    // The link shares the attachment's lock, so the other job goes next.
    let second = db.claim_next_job("w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(second.id, other.id);
    assert!(db.claim_next_job("w3", Utc::now()).await.unwrap().is_none());

    db.complete_job(&first.id, "w1", "uploaded").await.unwrap();
    let third = db.claim_next_job("w3", Utc::now()).await.unwrap().unwrap();
    assert_eq!(third.id, link.id);
}

pub async fn test_claim_respects_next_run_at(db: &dyn Database) {
    let job = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a4")))
        .await
        .unwrap()
        .job;
    let claimed = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    let later = Utc::now() + Duration::seconds(60);
    let retried = db
        .fail_job(
            &claimed.id,
            "w1",
            &JobFailure::Retry {
                error: "503".into(),
                next_run_at: later,
            },
        )
        .await
        .unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_eq!(retried.last_error.as_deref(), Some("503"));
    assert!(retried.claimed_by.is_none());

    assert!(db.claim_next_job("w1", Utc::now()).await.unwrap().is_none());
    let again = db
        .claim_next_job("w1", later + Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);
}

pub async fn test_retries_are_bounded(db: &dyn Database) {
    let job = db
        .enqueue_job(
            &NewSyncJob::new(JobType::Upload, TargetKey::attachment("a5")).with_max_attempts(3),
        )
        .await
        .unwrap()
        .job;

    let mut last = None;
    for _ in 0..3 {
        let claimed = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
        last = Some(
            db.fail_job(
                &claimed.id,
                "w1",
                &JobFailure::Retry {
                    error: "remote unavailable".into(),
                    next_run_at: Utc::now() - Duration::seconds(1),
                },
            )
            .await
            .unwrap(),
        );
    }
    let last = last.unwrap();
    assert_eq!(last.status, JobStatus::Dead);
    assert_eq!(last.attempts, 3);
    assert!(db.claim_next_job("w1", Utc::now()).await.unwrap().is_none());

    let events = db.list_events(Some(&job.id), 100).await.unwrap();
    let warns = events.iter().filter(|e| e.severity == Severity::Warn).count();
    let errors: Vec<_> = events
        .iter()
        .filter(|e| e.severity == Severity::Error)
        .collect();
    assert_eq!(warns, 3);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event_type, EventType::JobDead);

    let dead = db.list_jobs_by_status(JobStatus::Dead, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
}

pub async fn test_fatal_failure(db: &dyn Database) {
    db.enqueue_job(&NewSyncJob::new(JobType::Link, TargetKey::link("a6", 1)))
        .await
        .unwrap();
    let claimed = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    let failed = db
        .fail_job(
            &claimed.id,
            "w1",
            &JobFailure::Fatal {
                error: "bad request".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.finished_at.is_some());
}

pub async fn test_cancel_and_reschedule(db: &dyn Database) {
    let job = db
        .enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a7")))
        .await
        .unwrap()
        .job;
    let claimed = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    assert!(matches!(
        db.cancel_job(&claimed.id).await.unwrap_err(),
        DbError::Conflict(_)
    ));
    let far = Utc::now() + Duration::hours(1);
    db.fail_job(
        &claimed.id,
        "w1",
        &JobFailure::Retry {
            error: "timeout".into(),
            next_run_at: far,
        },
    )
    .await
    .unwrap();

    let now = Utc::now();
    let queued = db.reschedule_jobs("attachment:a7", now).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].next_run_at <= now);
    assert!(db.claim_next_job("w1", Utc::now()).await.unwrap().is_some());

    let second = db
        .enqueue_job(&NewSyncJob::new(JobType::Delete, TargetKey::attachment("a8")))
        .await
        .unwrap()
        .job;
    let cancelled = db.cancel_job(&second.id).await.unwrap();
    assert_eq!(cancelled.id, second.id);
    assert!(matches!(
        db.get_job(&second.id).await.unwrap_err(),
        DbError::NotFound(_)
    ));
    assert!(matches!(
        db.cancel_job(&second.id).await.unwrap_err(),
        DbError::NotFound(_)
    ));
    let history = db.list_events(Some(&job.id), 50).await.unwrap();
    assert!(history
        .iter()
        .any(|e| e.event_type == EventType::JobRescheduled));
}

pub async fn test_stale_jobs_and_counts(db: &dyn Database) {
    db.enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a9")))
        .await
        .unwrap();
    db.enqueue_job(&NewSyncJob::new(JobType::Download, TargetKey::work_item(3)))
        .await
        .unwrap();
    let claimed = db
        .claim_next_job("w1", Utc::now() - Duration::minutes(30))
        .await
        .unwrap();
    // Claims use the supplied clock, so a job queued "now" is not yet due.
    assert!(claimed.is_none());

    let claimed = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
    let stale = db
        .find_stale_jobs(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, claimed.id);
    assert!(db
        .find_stale_jobs(Utc::now() - Duration::minutes(5))
        .await
        .unwrap()
        .is_empty());

    let counts = db.count_jobs_by_status().await.unwrap();
    let count = |s: &str| {
        counts
            .iter()
            .find(|c| c.status == s)
            .map(|c| c.count)
            .unwrap_or(0)
    };
    assert_eq!(count("queued"), 1);
    assert_eq!(count("in_progress"), 1);
}

pub async fn test_event_summary(db: &dyn Database) {
    let start = Utc::now() - Duration::seconds(1);
    db.append_event(&NewSyncEvent::new(EventType::WebhookRejected, "bad signature"))
        .await
        .unwrap();
    db.append_event(&NewSyncEvent::new(EventType::WebhookMalformed, "not json"))
        .await
        .unwrap();
    db.append_event(&NewSyncEvent::new(EventType::WebhookIgnored, "workitem.deleted"))
        .await
        .unwrap();

    let summary = db.summarize_events(start).await.unwrap();
    assert_eq!(summary.error, 1);
    assert_eq!(summary.warn, 1);
    assert_eq!(summary.info, 1);
    assert_eq!(summary.since, Some(start));

    let future = db
        .summarize_events(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(future.total(), 0);

    let all = db.list_events(None, 2).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].event_type, EventType::WebhookIgnored);
}

pub async fn test_upload_sessions(db: &dyn Database) {
    let a = db.register_attachment(&register(10)).await.unwrap().attachment;
    let b = db.register_attachment(&register(11)).await.unwrap().attachment;
    let now = Utc::now();
    let ttl = Duration::hours(24);

    assert!(db.get_upload_session("s1").await.unwrap().is_none());
    let s = db
        .complete_upload_session("s1", &a.id, now, ttl)
        .await
        .unwrap();
    assert_eq!(s.attachment_id.as_deref(), Some(a.id.as_str()));

    // A live session keeps its first result.
    let replay = db
        .complete_upload_session("s1", &b.id, now + Duration::minutes(1), ttl)
        .await
        .unwrap();
    assert_eq!(replay.attachment_id.as_deref(), Some(a.id.as_str()));

    // Once expired it can be reused.
    let later = now + ttl + Duration::seconds(1);
    let reused = db
        .complete_upload_session("s1", &b.id, later, ttl)
        .await
        .unwrap();
    assert_eq!(reused.attachment_id.as_deref(), Some(b.id.as_str()));

    db.complete_upload_session("s2", &a.id, now - ttl * 2, ttl)
        .await
        .unwrap();
    let purged = db.purge_expired_sessions(now).await.unwrap();
    assert_eq!(purged, 1);
    assert!(db.get_upload_session("s2").await.unwrap().is_none());
    assert!(db.get_upload_session("s1").await.unwrap().is_some());
}

pub async fn test_upload_session_claims(db: &dyn Database) {
    let a = db.register_attachment(&register(12)).await.unwrap().attachment;
    let b = db.register_attachment(&register(13)).await.unwrap().attachment;
    let now = Utc::now();
    let pending = Duration::minutes(5);
    let ttl = Duration::hours(24);

    let first = db.claim_upload_session("c1", now, pending).await.unwrap();
    assert_eq!(first, SessionClaim::Claimed);

    // A second claimant sees the pending row and must not write.
    match db.claim_upload_session("c1", now, pending).await.unwrap() {
        SessionClaim::Existing(s) => assert!(s.is_pending()),
        SessionClaim::Claimed => panic!("live claim was taken twice"),
    }

    // The claim holder fills the pending row.
    let done = db
        .complete_upload_session("c1", &a.id, now, ttl)
        .await
        .unwrap();
    assert_eq!(done.attachment_id.as_deref(), Some(a.id.as_str()));
    match db.claim_upload_session("c1", now, pending).await.unwrap() {
        SessionClaim::Existing(s) => assert_eq!(s.attachment_id.as_deref(), Some(a.id.as_str())),
        SessionClaim::Claimed => panic!("resolved session was reclaimed"),
    }

    // Releasing only drops pending rows.
    db.release_upload_session("c1").await.unwrap();
    assert!(db.get_upload_session("c1").await.unwrap().is_some());

    db.claim_upload_session("c2", now, pending).await.unwrap();
    db.release_upload_session("c2").await.unwrap();
    assert!(db.get_upload_session("c2").await.unwrap().is_none());

    // An abandoned claim can be taken over once it lapses.
    db.claim_upload_session("c3", now, pending).await.unwrap();
    let lapsed = now + pending + Duration::seconds(1);
    assert_eq!(
        db.claim_upload_session("c3", lapsed, pending).await.unwrap(),
        SessionClaim::Claimed
    );

    // Deleting the attachment drops sessions that resolved to it.
    db.complete_upload_session("c4", &b.id, now, ttl)
        .await
        .unwrap();
    db.delete_attachment(&b.id, true).await.unwrap();
    assert!(db.get_upload_session("c4").await.unwrap().is_none());
}
