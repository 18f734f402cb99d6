use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use casebook_core::sync_event::{EventType, NewSyncEvent};
use casebook_core::sync_job::{
    EnqueueOutcome, JobFailure, JobPayload, JobStatus, JobStatusCount, JobType, NewSyncJob,
    SyncJob,
};

use super::events::insert_event;
use super::super::{is_unique_violation, pg_err, pg_not_found, PostgresDatabase};
use crate::DbError;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    target_key: String,
    lock_key: String,
    attachment_id: Option<String>,
    work_item_id: Option<i64>,
    payload: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: DateTime<Utc>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = DbError;

    fn try_from(r: JobRow) -> Result<Self, DbError> {
        Ok(SyncJob {
            job_type: JobType::parse_str(&r.job_type)
                .ok_or_else(|| DbError::Internal(format!("unknown job type {}", r.job_type)))?,
            status: JobStatus::parse_str(&r.status)
                .ok_or_else(|| DbError::Internal(format!("unknown job status {}", r.status)))?,
            payload: JobPayload::from_json(&r.payload),
            id: r.id,
            target_key: r.target_key,
            lock_key: r.lock_key,
            attachment_id: r.attachment_id,
            work_item_id: r.work_item_id,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
            next_run_at: r.next_run_at,
            last_error: r.last_error,
            claimed_by: r.claimed_by,
            claimed_at: r.claimed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            finished_at: r.finished_at,
        })
    }
}

fn to_jobs(rows: Vec<JobRow>) -> Result<Vec<SyncJob>, DbError> {
    rows.into_iter().map(TryInto::try_into).collect()
}

async fn lock_job(conn: &mut PgConnection, id: &str) -> Result<SyncJob, DbError> {
    sqlx::query_as::<_, JobRow>("SELECT * FROM sync_job_queue WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(pg_err)?
        .ok_or_else(|| pg_not_found(&format!("job {id}")))?
        .try_into()
}

/// Only the worker holding the claim may finish a job. A claim taken
/// over by the watchdog and handed to another worker is no longer ours.
fn require_claimed_by(job: &SyncJob, worker_id: &str) -> Result<(), DbError> {
    if job.status != JobStatus::InProgress {
        return Err(DbError::Conflict(format!(
            "job {} is {}, not in_progress",
            job.id, job.status
        )));
    }
    if job.claimed_by.as_deref() != Some(worker_id) {
        return Err(DbError::Conflict(format!(
            "job {} is claimed by {}, not {worker_id}",
            job.id,
            job.claimed_by.as_deref().unwrap_or("nobody")
        )));
    }
    Ok(())
}

impl PostgresDatabase {
    pub(crate) async fn pg_enqueue_job(
        &self,
        input: &NewSyncJob,
    ) -> Result<EnqueueOutcome, DbError> {
        if input.target.is_empty() {
            return Err(DbError::Internal("job target is empty".into()));
        }
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let now = Utc::now();
        let target_key = input.target.as_key();

        if input.job_type.coalesces() {
            let pending = sqlx::query_as::<_, JobRow>(
                "SELECT * FROM sync_job_queue
                 WHERE job_type = $1 AND target_key = $2 AND status = 'queued'
                 ORDER BY created_at, seq
                 LIMIT 1
                 FOR UPDATE",
            )
            .bind(input.job_type.as_str())
            .bind(&target_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(pg_err)?;

            if let Some(row) = pending {
                let job: SyncJob = row.try_into()?;
                insert_event(
                    &mut tx,
                    &NewSyncEvent::for_job(
                        &job.id,
                        EventType::JobCoalesced,
                        format!("{} (folded into pending job)", input.message),
                    ),
                    now,
                )
                .await?;
                tx.commit().await.map_err(pg_err)?;
                return Ok(EnqueueOutcome {
                    job,
                    coalesced: true,
                });
            }
        }

        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO sync_job_queue
                (id, job_type, target_key, lock_key, attachment_id, work_item_id,
                 payload, status, attempts, max_attempts, next_run_at,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', 0, $8, $9, $9, $9)
             RETURNING *",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(input.job_type.as_str())
        .bind(&target_key)
        .bind(input.target.lock_key())
        .bind(&input.target.attachment_id)
        .bind(input.target.work_item_id)
        .bind(input.payload.to_json())
        .bind(input.max_attempts.max(1))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(pg_err)?;
        let job: SyncJob = row.try_into()?;

        insert_event(
            &mut tx,
            &NewSyncEvent::for_job(&job.id, EventType::JobEnqueued, input.message.clone()),
            now,
        )
        .await?;
        tx.commit().await.map_err(pg_err)?;

        Ok(EnqueueOutcome {
            job,
            coalesced: false,
        })
    }

    /// Claims with `FOR UPDATE SKIP LOCKED`. Two workers racing for jobs on
    /// the same lock key are resolved by the partial unique index: the
    /// loser sees a unique violation and reports nothing claimed.
    pub(crate) async fn pg_claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let candidate = sqlx::query_as::<_, JobRow>(
            "SELECT j.* FROM sync_job_queue j
             WHERE j.status = 'queued'
               AND j.next_run_at <= $1
               AND NOT EXISTS (
                   SELECT 1 FROM sync_job_queue k
                   WHERE k.lock_key = j.lock_key AND k.status = 'in_progress'
               )
             ORDER BY j.created_at, j.seq
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some(candidate) = candidate else {
            tx.commit().await.map_err(pg_err)?;
            return Ok(None);
        };

        let claimed = sqlx::query_as::<_, JobRow>(
            "UPDATE sync_job_queue
             SET status = 'in_progress', attempts = attempts + 1,
                 claimed_by = $1, claimed_at = $2, updated_at = $2
             WHERE id = $3
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(&candidate.id)
        .fetch_one(&mut *tx)
        .await;

        let row = match claimed {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(pg_err)?;
                return Ok(None);
            }
            Err(e) => return Err(pg_err(e)),
        };
        let job: SyncJob = row.try_into()?;

        insert_event(
            &mut tx,
            &NewSyncEvent::for_job(
                &job.id,
                EventType::JobClaimed,
                format!(
                    "attempt {}/{} claimed by {worker_id}",
                    job.attempts, job.max_attempts
                ),
            ),
            now,
        )
        .await?;
        tx.commit().await.map_err(pg_err)?;

        Ok(Some(job))
    }

    pub(crate) async fn pg_complete_job(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<SyncJob, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let job = lock_job(&mut tx, id).await?;
        require_claimed_by(&job, worker_id)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE sync_job_queue
             SET status = 'succeeded', finished_at = $1, updated_at = $1
             WHERE id = $2 AND claimed_by = $3
             RETURNING *",
        )
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(pg_err)?;

        insert_event(
            &mut tx,
            &NewSyncEvent::for_job(id, EventType::JobSucceeded, message),
            now,
        )
        .await?;
        tx.commit().await.map_err(pg_err)?;

        row.try_into()
    }

    pub(crate) async fn pg_fail_job(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<SyncJob, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let job = lock_job(&mut tx, id).await?;
        require_claimed_by(&job, worker_id)?;
        let now = Utc::now();
        let attempt = format!("attempt {}/{}", job.attempts, job.max_attempts);

        let failure = match failure {
            JobFailure::Retry { error, .. } if job.attempts_exhausted() => JobFailure::Dead {
                error: error.clone(),
            },
            other => other.clone(),
        };

        let row = match &failure {
            JobFailure::Retry { error, next_run_at } => {
                let row = sqlx::query_as::<_, JobRow>(
                    "UPDATE sync_job_queue
                     SET status = 'queued', next_run_at = $1, last_error = $2,
                         claimed_by = NULL, claimed_at = NULL, updated_at = $3
                     WHERE id = $4 AND claimed_by = $5
                     RETURNING *",
                )
                .bind(next_run_at)
                .bind(error)
                .bind(now)
                .bind(id)
                .bind(worker_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?;
                insert_event(
                    &mut tx,
                    &NewSyncEvent::for_job(
                        id,
                        EventType::JobRetryScheduled,
                        format!("{attempt} failed: {error}; retrying at {next_run_at}"),
                    ),
                    now,
                )
                .await?;
                row
            }
            JobFailure::Dead { error } => {
                let row = sqlx::query_as::<_, JobRow>(
                    "UPDATE sync_job_queue
                     SET status = 'dead', last_error = $1, finished_at = $2, updated_at = $2
                     WHERE id = $3 AND claimed_by = $4
                     RETURNING *",
                )
                .bind(error)
                .bind(now)
                .bind(id)
                .bind(worker_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?;
                insert_event(
                    &mut tx,
                    &NewSyncEvent::for_job(
                        id,
                        EventType::JobAttemptFailed,
                        format!("{attempt} failed: {error}"),
                    ),
                    now,
                )
                .await?;
                insert_event(
                    &mut tx,
                    &NewSyncEvent::for_job(
                        id,
                        EventType::JobDead,
                        format!("giving up after {} attempts: {error}", job.attempts),
                    ),
                    now,
                )
                .await?;
                row
            }
            JobFailure::Fatal { error } => {
                let row = sqlx::query_as::<_, JobRow>(
                    "UPDATE sync_job_queue
                     SET status = 'failed', last_error = $1, finished_at = $2, updated_at = $2
                     WHERE id = $3 AND claimed_by = $4
                     RETURNING *",
                )
                .bind(error)
                .bind(now)
                .bind(id)
                .bind(worker_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(pg_err)?;
                insert_event(
                    &mut tx,
                    &NewSyncEvent::for_job(
                        id,
                        EventType::JobFailed,
                        format!("{attempt} failed permanently: {error}"),
                    ),
                    now,
                )
                .await?;
                row
            }
        };
        tx.commit().await.map_err(pg_err)?;

        row.try_into()
    }

    pub(crate) async fn pg_get_job(&self, id: &str) -> Result<SyncJob, DbError> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM sync_job_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err)?
            .ok_or_else(|| pg_not_found(&format!("job {id}")))?
            .try_into()
    }

    pub(crate) async fn pg_list_jobs_for_attachment(
        &self,
        attachment_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM sync_job_queue WHERE attachment_id = $1
             ORDER BY created_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(attachment_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        to_jobs(rows)
    }

    pub(crate) async fn pg_list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM sync_job_queue WHERE status = $1
             ORDER BY updated_at DESC, seq DESC
             LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        to_jobs(rows)
    }

    pub(crate) async fn pg_cancel_job(&self, id: &str) -> Result<SyncJob, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let job = lock_job(&mut tx, id).await?;
        if job.status != JobStatus::Queued {
            return Err(DbError::Conflict(format!(
                "job {id} is {}; only queued jobs can be cancelled",
                job.status
            )));
        }

        sqlx::query("DELETE FROM sync_job_queue WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        insert_event(
            &mut tx,
            &NewSyncEvent::for_job(
                id,
                EventType::JobCancelled,
                format!("{} for {} cancelled", job.job_type, job.target_key),
            ),
            Utc::now(),
        )
        .await?;
        tx.commit().await.map_err(pg_err)?;

        Ok(job)
    }

    pub(crate) async fn pg_reschedule_jobs(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;

        let moved = sqlx::query_as::<_, JobRow>(
            "UPDATE sync_job_queue SET next_run_at = $1, updated_at = $1
             WHERE lock_key = $2 AND status = 'queued' AND next_run_at > $1
             RETURNING *",
        )
        .bind(now)
        .bind(lock_key)
        .fetch_all(&mut *tx)
        .await
        .map_err(pg_err)?;

        for job in to_jobs(moved)? {
            insert_event(
                &mut tx,
                &NewSyncEvent::for_job(
                    &job.id,
                    EventType::JobRescheduled,
                    format!("{} for {} made due now", job.job_type, job.target_key),
                ),
                now,
            )
            .await?;
        }

        let queued = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM sync_job_queue
             WHERE lock_key = $1 AND status = 'queued'
             ORDER BY created_at, seq",
        )
        .bind(lock_key)
        .fetch_all(&mut *tx)
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;

        to_jobs(queued)
    }

    pub(crate) async fn pg_find_stale_jobs(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM sync_job_queue
             WHERE status = 'in_progress' AND claimed_at < $1
             ORDER BY claimed_at",
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        to_jobs(rows)
    }

    pub(crate) async fn pg_count_jobs_by_status(&self) -> Result<Vec<JobStatusCount>, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT name, count FROM sync_summary
             WHERE kind = 'job_status'
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| JobStatusCount { status, count })
            .collect())
    }
}
