use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use casebook_core::sync_event::{EventType, NewSyncEvent};
use casebook_core::sync_job::{
    EnqueueOutcome, JobFailure, JobPayload, JobStatus, JobStatusCount, JobType, NewSyncJob,
    SyncJob,
};

use super::events::insert_event;
use super::super::{not_found_or, SqliteDatabase, SqliteResultExt};
use crate::DbError;

fn conversion_error(what: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, what.into())
}

pub(crate) fn row_to_job(row: &Row) -> rusqlite::Result<SyncJob> {
    let type_str: String = row.get("job_type")?;
    let status_str: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    Ok(SyncJob {
        id: row.get("id")?,
        job_type: JobType::parse_str(&type_str)
            .ok_or_else(|| conversion_error(format!("unknown job type {type_str}")))?,
        target_key: row.get("target_key")?,
        lock_key: row.get("lock_key")?,
        attachment_id: row.get("attachment_id")?,
        work_item_id: row.get("work_item_id")?,
        payload: JobPayload::from_json(&payload),
        status: JobStatus::parse_str(&status_str)
            .ok_or_else(|| conversion_error(format!("unknown job status {status_str}")))?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        next_run_at: row.get("next_run_at")?,
        last_error: row.get("last_error")?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: row.get("claimed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        finished_at: row.get("finished_at")?,
    })
}

fn load_job(conn: &Connection, id: &str) -> Result<SyncJob, DbError> {
    conn.query_row(
        "SELECT * FROM sync_job_queue WHERE id = ?1",
        params![id],
        row_to_job,
    )
    .map_err(not_found_or(format!("job {id}")))
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

impl SqliteDatabase {
    pub fn enqueue_job_sync(&self, input: &NewSyncJob) -> Result<EnqueueOutcome, DbError> {
        if input.target.is_empty() {
            return Err(DbError::Internal("job target is empty".into()));
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let now = Utc::now();
            let target_key = input.target.as_key();

            if input.job_type.coalesces() {
                let pending = tx
                    .query_row(
                        "SELECT * FROM sync_job_queue
                         WHERE job_type = ?1 AND target_key = ?2 AND status = 'queued'
                         ORDER BY created_at, rowid
                         LIMIT 1",
                        params![input.job_type.as_str(), target_key],
                        row_to_job,
                    )
                    .optional()
                    .to_db()?;
                if let Some(job) = pending {
                    insert_event(
                        &tx,
                        &NewSyncEvent::for_job(
                            &job.id,
                            EventType::JobCoalesced,
                            format!("{} (folded into pending job)", input.message),
                        ),
                        now,
                    )
                    .to_db()?;
                    tx.commit().to_db()?;
                    return Ok(EnqueueOutcome {
                        job,
                        coalesced: true,
                    });
                }
            }

            let id = uuid::Uuid::new_v4().to_string();
            let job = tx
                .query_row(
                    "INSERT INTO sync_job_queue
                        (id, job_type, target_key, lock_key, attachment_id, work_item_id,
                         payload, status, attempts, max_attempts, next_run_at,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', 0, ?8, ?9, ?9, ?9)
                     RETURNING *",
                    params![
                        id,
                        input.job_type.as_str(),
                        target_key,
                        input.target.lock_key(),
                        input.target.attachment_id,
                        input.target.work_item_id,
                        input.payload.to_json(),
                        input.max_attempts.max(1),
                        now
                    ],
                    row_to_job,
                )
                .to_db()?;
            insert_event(
                &tx,
                &NewSyncEvent::for_job(&job.id, EventType::JobEnqueued, input.message.clone()),
                now,
            )
            .to_db()?;
            tx.commit().to_db()?;
            Ok(EnqueueOutcome {
                job,
                coalesced: false,
            })
        })
    }

    pub fn claim_next_job_sync(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncJob>, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let claimed = tx
                .query_row(
                    "UPDATE sync_job_queue
                     SET status = 'in_progress', attempts = attempts + 1,
                         claimed_by = ?1, claimed_at = ?2, updated_at = ?2
                     WHERE id = (
                         SELECT j.id FROM sync_job_queue j
                         WHERE j.status = 'queued'
                           AND j.next_run_at <= ?2
                           AND NOT EXISTS (
                               SELECT 1 FROM sync_job_queue k
                               WHERE k.lock_key = j.lock_key AND k.status = 'in_progress'
                           )
                         ORDER BY j.created_at, j.rowid
                         LIMIT 1
                     )
                     RETURNING *",
                    params![worker_id, now],
                    row_to_job,
                )
                .optional()
                .to_db()?;

            let Some(job) = claimed else {
                return Ok(None);
            };
            insert_event(
                &tx,
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
            .to_db()?;
            tx.commit().to_db()?;
            Ok(Some(job))
        })
    }

    pub fn complete_job_sync(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
    ) -> Result<SyncJob, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let job = load_job(&tx, id)?;
            require_claimed_by(&job, worker_id)?;
            let now = Utc::now();
            let job = tx
                .query_row(
                    "UPDATE sync_job_queue
                     SET status = 'succeeded', finished_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND claimed_by = ?3
                     RETURNING *",
                    params![now, id, worker_id],
                    row_to_job,
                )
                .to_db()?;
            insert_event(
                &tx,
                &NewSyncEvent::for_job(id, EventType::JobSucceeded, message),
                now,
            )
            .to_db()?;
            tx.commit().to_db()?;
            Ok(job)
        })
    }

    pub fn fail_job_sync(
        &self,
        id: &str,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<SyncJob, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let job = load_job(&tx, id)?;
            require_claimed_by(&job, worker_id)?;
            let now = Utc::now();
            let attempt = format!("attempt {}/{}", job.attempts, job.max_attempts);

            let failure = match failure {
                JobFailure::Retry { error, .. } if job.attempts_exhausted() => JobFailure::Dead {
                    error: error.clone(),
                },
                other => other.clone(),
            };

            let updated = match &failure {
                JobFailure::Retry { error, next_run_at } => {
                    let job = tx
                        .query_row(
                            "UPDATE sync_job_queue
                             SET status = 'queued', next_run_at = ?1, last_error = ?2,
                                 claimed_by = NULL, claimed_at = NULL, updated_at = ?3
                             WHERE id = ?4 AND claimed_by = ?5
                             RETURNING *",
                            params![next_run_at, error, now, id, worker_id],
                            row_to_job,
                        )
                        .to_db()?;
                    insert_event(
                        &tx,
                        &NewSyncEvent::for_job(
                            id,
                            EventType::JobRetryScheduled,
                            format!("{attempt} failed: {error}; retrying at {next_run_at}"),
                        ),
                        now,
                    )
                    .to_db()?;
                    job
                }
                JobFailure::Dead { error } => {
                    let job = tx
                        .query_row(
                            "UPDATE sync_job_queue
                             SET status = 'dead', last_error = ?1,
                                 finished_at = ?2, updated_at = ?2
                             WHERE id = ?3 AND claimed_by = ?4
                             RETURNING *",
                            params![error, now, id, worker_id],
                            row_to_job,
                        )
                        .to_db()?;
                    insert_event(
                        &tx,
                        &NewSyncEvent::for_job(
                            id,
                            EventType::JobAttemptFailed,
                            format!("{attempt} failed: {error}"),
                        ),
                        now,
                    )
                    .to_db()?;
                    insert_event(
                        &tx,
                        &NewSyncEvent::for_job(
                            id,
                            EventType::JobDead,
                            format!("giving up after {} attempts: {error}", job.attempts),
                        ),
                        now,
                    )
                    .to_db()?;
                    job
                }
                JobFailure::Fatal { error } => {
                    let job = tx
                        .query_row(
                            "UPDATE sync_job_queue
                             SET status = 'failed', last_error = ?1,
                                 finished_at = ?2, updated_at = ?2
                             WHERE id = ?3 AND claimed_by = ?4
                             RETURNING *",
                            params![error, now, id, worker_id],
                            row_to_job,
                        )
                        .to_db()?;
                    insert_event(
                        &tx,
                        &NewSyncEvent::for_job(
                            id,
                            EventType::JobFailed,
                            format!("{attempt} failed permanently: {error}"),
                        ),
                        now,
                    )
                    .to_db()?;
                    job
                }
            };
            tx.commit().to_db()?;
            Ok(updated)
        })
    }

    pub fn get_job_sync(&self, id: &str) -> Result<SyncJob, DbError> {
        self.with_conn(|conn| load_job(conn, id))
    }

    /// Newest first.
    pub fn list_jobs_for_attachment_sync(
        &self,
        attachment_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM sync_job_queue WHERE attachment_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .to_db()?;
            let jobs = stmt
                .query_map(params![attachment_id, limit], row_to_job)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(jobs)
        })
    }

    pub fn list_jobs_by_status_sync(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM sync_job_queue WHERE status = ?1
                     ORDER BY updated_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .to_db()?;
            let jobs = stmt
                .query_map(params![status.as_str(), limit], row_to_job)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(jobs)
        })
    }

    pub fn cancel_job_sync(&self, id: &str) -> Result<SyncJob, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let job = load_job(&tx, id)?;
            if job.status != JobStatus::Queued {
                return Err(DbError::Conflict(format!(
                    "job {id} is {}; only queued jobs can be cancelled",
                    job.status
                )));
            }
            tx.execute("DELETE FROM sync_job_queue WHERE id = ?1", params![id])
                .to_db()?;
            insert_event(
                &tx,
                &NewSyncEvent::for_job(
                    id,
                    EventType::JobCancelled,
                    format!("{} for {} cancelled", job.job_type, job.target_key),
                ),
                Utc::now(),
            )
            .to_db()?;
            tx.commit().to_db()?;
            Ok(job)
        })
    }

    pub fn reschedule_jobs_sync(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().to_db()?;
            let moved = {
                let mut stmt = tx
                    .prepare(
                        "UPDATE sync_job_queue SET next_run_at = ?1, updated_at = ?1
                         WHERE lock_key = ?2 AND status = 'queued' AND next_run_at > ?1
                         RETURNING *",
                    )
                    .to_db()?;
                let rows = stmt
                    .query_map(params![now, lock_key], row_to_job)
                    .to_db()?
                    .collect::<Result<Vec<_>, _>>()
                    .to_db()?;
                rows
            };
            for job in &moved {
                insert_event(
                    &tx,
                    &NewSyncEvent::for_job(
                        &job.id,
                        EventType::JobRescheduled,
                        format!("{} for {} made due now", job.job_type, job.target_key),
                    ),
                    now,
                )
                .to_db()?;
            }

            let queued = {
                let mut stmt = tx
                    .prepare(
                        "SELECT * FROM sync_job_queue
                         WHERE lock_key = ?1 AND status = 'queued'
                         ORDER BY created_at, rowid",
                    )
                    .to_db()?;
                let rows = stmt
                    .query_map(params![lock_key], row_to_job)
                    .to_db()?
                    .collect::<Result<Vec<_>, _>>()
                    .to_db()?;
                rows
            };
            tx.commit().to_db()?;
            Ok(queued)
        })
    }

    pub fn find_stale_jobs_sync(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM sync_job_queue
                     WHERE status = 'in_progress' AND claimed_at < ?1
                     ORDER BY claimed_at",
                )
                .to_db()?;
            let jobs = stmt
                .query_map(params![claimed_before], row_to_job)
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(jobs)
        })
    }

    pub fn count_jobs_by_status_sync(&self) -> Result<Vec<JobStatusCount>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, count FROM sync_summary
                     WHERE kind = 'job_status'
                     ORDER BY name",
                )
                .to_db()?;
            let counts = stmt
                .query_map([], |row| {
                    Ok(JobStatusCount {
                        status: row.get(0)?,
                        count: row.get(1)?,
                    })
                })
                .to_db()?
                .collect::<Result<Vec<_>, _>>()
                .to_db()?;
            Ok(counts)
        })
    }
}
