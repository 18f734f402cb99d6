use std::time::Duration;

use clap::{Args, Parser};

use casebook_core::backoff::BackoffPolicy;

/// Queue tuning shared by the standalone worker and the server's
/// in-process pool.
#[derive(Debug, Clone, Args)]
pub struct WorkerOptions {
    /// Number of concurrent executors
    #[arg(long, env = "CASEBOOK_WORKERS", default_value = "2")]
    pub workers: usize,

    /// Seconds between queue polls when idle
    #[arg(long, env = "CASEBOOK_POLL_INTERVAL", default_value = "2")]
    pub poll_interval: u64,

    /// Per-attempt execution timeout (seconds). Exceeding it counts as a
    /// retryable failure.
    #[arg(long, env = "CASEBOOK_JOB_TIMEOUT", default_value = "120")]
    pub job_timeout: u64,

    /// First retry delay (seconds); doubles per attempt
    #[arg(long, env = "CASEBOOK_BACKOFF_BASE", default_value = "5")]
    pub backoff_base: u64,

    /// Upper bound on the retry delay (seconds)
    #[arg(long, env = "CASEBOOK_BACKOFF_CAP", default_value = "300")]
    pub backoff_cap: u64,

    /// Attempts before a job is declared dead
    #[arg(long, env = "CASEBOOK_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: i32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: 2,
            job_timeout: 120,
            backoff_base: 5,
            backoff_cap: 300,
            max_attempts: casebook_core::sync_job::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl WorkerOptions {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base),
            Duration::from_secs(self.backoff_cap),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout.max(1))
    }

    /// An IN_PROGRESS job claimed longer ago than this has lost its worker.
    pub fn stale_after(&self) -> Duration {
        self.job_timeout() * 4
    }
}

#[derive(Debug, Parser)]
#[command(name = "casebook-worker", about = "Casebook attachment sync worker")]
pub struct WorkerConfig {
    #[command(flatten)]
    pub options: WorkerOptions,

    /// Prefix for worker ids recorded on claimed jobs (defaults to the hostname)
    #[arg(long, env = "CASEBOOK_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Port for the health check endpoint
    #[arg(long, env = "CASEBOOK_WORKER_HEALTH_PORT", default_value = "3721")]
    pub health_port: u16,
}

impl WorkerConfig {
    pub fn worker_prefix(&self) -> String {
        self.worker_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker".into())
    }
}
