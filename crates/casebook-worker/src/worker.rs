use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use casebook_core::backoff::BackoffPolicy;
use casebook_core::sync_job::{JobFailure, SyncJob};
use casebook_core::SyncError;
use casebook_db::{Database, DbError};

use crate::config::WorkerOptions;
use crate::executor::JobExecutor;

/// What a single pass over the queue did.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Idle,
    Succeeded(SyncJob),
    Failed(SyncJob),
    /// The claim was taken over before the result could be recorded; the
    /// result is discarded. Carries the job id.
    Lost(String),
}

/// One queue consumer. Several may share a database; the claim query keeps
/// them from ever holding two jobs on the same lock key.
pub struct Worker {
    id: String,
    db: Arc<dyn Database>,
    executor: Arc<JobExecutor>,
    backoff: BackoffPolicy,
    job_timeout: Duration,
    poll_interval: Duration,
    wake: Arc<Notify>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        db: Arc<dyn Database>,
        executor: Arc<JobExecutor>,
        options: &WorkerOptions,
    ) -> Self {
        Self {
            id: id.into(),
            db,
            executor,
            backoff: options.backoff(),
            job_timeout: options.job_timeout(),
            poll_interval: options.poll_interval(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and execute at most one due job.
    pub async fn run_once(&self) -> Result<RunOutcome, SyncError> {
        let Some(job) = self.db.claim_next_job(&self.id, Utc::now()).await? else {
            return Ok(RunOutcome::Idle);
        };
        info!(
            worker = %self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            target = %job.target_key,
            attempt = job.attempts,
            "claimed job"
        );

        let result = match tokio::time::timeout(self.job_timeout, self.executor.execute(&job)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "attempt exceeded {}s",
                self.job_timeout.as_secs_f64()
            ))),
        };

        match result {
            Ok(message) => match self.db.complete_job(&job.id, &self.id, &message).await {
                Ok(done) => {
                    info!(worker = %self.id, job_id = %done.id, "{message}");
                    Ok(RunOutcome::Succeeded(done))
                }
                Err(DbError::Conflict(reason)) => Ok(self.lost(&job, &reason)),
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                let failure = self.classify(&job, &e);
                match &failure {
                    JobFailure::Retry { next_run_at, .. } => warn!(
                        worker = %self.id,
                        job_id = %job.id,
                        kind = e.kind(),
                        retry_at = %next_run_at,
                        "attempt {}/{} failed: {e}",
                        job.attempts,
                        job.max_attempts
                    ),
                    _ => error!(
                        worker = %self.id,
                        job_id = %job.id,
                        kind = e.kind(),
                        "job failed permanently: {e}"
                    ),
                }
                match self.db.fail_job(&job.id, &self.id, &failure).await {
                    Ok(failed) => Ok(RunOutcome::Failed(failed)),
                    Err(DbError::Conflict(reason)) => Ok(self.lost(&job, &reason)),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn lost(&self, job: &SyncJob, reason: &str) -> RunOutcome {
        warn!(worker = %self.id, job_id = %job.id, "result discarded: {reason}");
        RunOutcome::Lost(job.id.clone())
    }

    fn classify(&self, job: &SyncJob, e: &SyncError) -> JobFailure {
        let error = e.to_string();
        if !e.is_retryable() {
            JobFailure::Fatal { error }
        } else if job.attempts_exhausted() {
            JobFailure::Dead { error }
        } else {
            JobFailure::Retry {
                error,
                next_run_at: self.backoff.next_run_at(Utc::now(), job.attempts),
            }
        }
    }

    /// Keep running jobs until nothing is due, then wait for a wake-up, the
    /// poll interval or shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(RunOutcome::Idle) => {}
                Ok(_) => continue,
                Err(e) => error!(worker = %self.id, "queue error: {e}"),
            }

            tokio::select! {
                _ = self.wake.notified() => debug!(worker = %self.id, "woken"),
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}

/// Spawn `options.workers` workers sharing one executor and wake signal.
pub fn spawn_pool(
    prefix: &str,
    db: Arc<dyn Database>,
    executor: Arc<JobExecutor>,
    options: &WorkerOptions,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..options.workers.max(1))
        .map(|n| {
            let worker = Worker::new(
                format!("{prefix}-{n}"),
                db.clone(),
                executor.clone(),
                options,
            )
            .with_wake(wake.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
