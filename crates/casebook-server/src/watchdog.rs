use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use casebook_core::sync_job::JobFailure;
use casebook_db::{Database, DbError};

/// Background task that returns jobs abandoned by a crashed worker to the
/// queue and purges expired upload sessions.
///
/// A job is abandoned once it has been IN_PROGRESS for longer than
/// `stale_after`. Workers give up on an attempt after the per-attempt
/// timeout, so `stale_after` must be comfortably larger than that.
pub async fn run_watchdog(
    db: Arc<dyn Database>,
    stale_after: Duration,
    scan_interval: Duration,
    wake: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    loop {
        ticker.tick().await;
        match reclaim_stale_jobs(&*db, stale_after).await {
            Ok(0) => {}
            Ok(_) => wake.notify_one(),
            Err(e) => error!("watchdog error: {e}"),
        }
        if let Err(e) = purge_sessions(&*db).await {
            error!("watchdog session purge failed: {e}");
        }
    }
}

/// Returns how many jobs were handed back to the queue (or declared dead).
pub async fn reclaim_stale_jobs(db: &dyn Database, stale_after: Duration) -> Result<usize, DbError> {
    let threshold = Utc::now()
        - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::hours(1));
    let stale = db.find_stale_jobs(threshold).await?;

    let mut reclaimed = 0;
    for job in stale {
        warn!(
            "watchdog: reclaiming job {} ({} on {}, claimed by {} at {})",
            job.id,
            job.job_type,
            job.target_key,
            job.claimed_by.as_deref().unwrap_or("?"),
            job.claimed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        let Some(owner) = job.claimed_by.as_deref() else {
            continue;
        };
        let failure = JobFailure::Retry {
            error: format!(
                "worker lease expired after {}s without completion",
                stale_after.as_secs()
            ),
            next_run_at: Utc::now(),
        };
        match db.fail_job(&job.id, owner, &failure).await {
            Ok(updated) => {
                info!(job_id = %updated.id, status = %updated.status, "stale job reclaimed");
                reclaimed += 1;
            }
            // Finished or re-claimed between the scan and the update.
            Err(DbError::Conflict(_)) | Err(DbError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reclaimed)
}

async fn purge_sessions(db: &dyn Database) -> Result<(), DbError> {
    let purged = db.purge_expired_sessions(Utc::now()).await?;
    if purged > 0 {
        info!("watchdog: purged {purged} expired upload session(s)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_core::sync_event::EventType;
    use casebook_core::sync_job::{JobStatus, JobType, NewSyncJob, TargetKey};
    use casebook_db::SqliteDatabase;

    #[tokio::test]
    async fn reclaim_on_empty_db() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        assert_eq!(reclaim_stale_jobs(&db, Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_claims_are_untouched() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a1")))
            .await
            .unwrap();
        let job = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();

        let n = reclaim_stale_jobs(&db, Duration::from_secs(600)).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(db.get_job(&job.id).await.unwrap().status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn stale_claims_return_to_the_queue() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.enqueue_job(&NewSyncJob::new(JobType::Upload, TargetKey::attachment("a1")))
            .await
            .unwrap();
        let job = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let n = reclaim_stale_jobs(&db, Duration::from_millis(1)).await.unwrap();
        assert_eq!(n, 1);

        let job = db.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.claimed_by.is_none());
        assert!(job.last_error.unwrap().contains("lease expired"));

        let events = db.list_events(Some(&job.id), 10).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::JobRetryScheduled));

        // Claimable again right away.
        let again = db.claim_next_job("w2", Utc::now()).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);

        // The worker that lost the lease cannot overwrite the new claim.
        assert!(matches!(
            db.complete_job(&job.id, "w1", "late").await,
            Err(DbError::Conflict(_))
        ));
        db.complete_job(&job.id, "w2", "done").await.unwrap();
    }

    #[tokio::test]
    async fn stale_claim_on_last_attempt_goes_dead() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.enqueue_job(
            &NewSyncJob::new(JobType::Upload, TargetKey::attachment("a1")).with_max_attempts(1),
        )
        .await
        .unwrap();
        let job = db.claim_next_job("w1", Utc::now()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        reclaim_stale_jobs(&db, Duration::from_millis(1)).await.unwrap();
        assert_eq!(db.get_job(&job.id).await.unwrap().status, JobStatus::Dead);
    }
}
