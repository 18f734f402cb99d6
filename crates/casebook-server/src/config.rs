use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, Subcommand};

use casebook_service::ServiceConfig;
use casebook_worker::WorkerOptions;

#[derive(Debug, Parser)]
#[command(name = "casebook-server", about = "Casebook attachment sync server")]
pub struct ServerConfig {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on
    #[arg(long, env = "CASEBOOK_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "CASEBOOK_PORT", default_value = "3720")]
    pub port: u16,

    /// Shared secret for webhook signatures. Without it every webhook is rejected.
    #[arg(long, env = "CASEBOOK_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Bearer token required on the /sync surface (open when unset)
    #[arg(long, env = "CASEBOOK_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Seconds a completed upload session can be replayed
    #[arg(long, env = "CASEBOOK_SESSION_TTL", default_value = "86400")]
    pub session_ttl: i64,

    /// Seconds between watchdog scans for abandoned jobs
    #[arg(long, env = "CASEBOOK_WATCHDOG_INTERVAL", default_value = "30")]
    pub watchdog_interval: u64,

    /// Prefix for in-process worker ids
    #[arg(long, env = "CASEBOOK_WORKER_ID", default_value = "server")]
    pub worker_id: String,

    #[command(flatten)]
    pub worker: WorkerOptions,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List jobs that exhausted their retries
    DeadJobs {
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Cancel a queued job
    CancelJob {
        /// The job ID to cancel
        id: String,
    },
    /// Event counts by severity and job counts by status
    Summary {
        /// Look-back window in seconds
        #[arg(long, default_value = "3600")]
        window_secs: i64,
    },
    /// Generate a random API key for CASEBOOK_API_KEY
    Keygen,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            session_ttl: chrono::Duration::seconds(self.session_ttl.max(1)),
            max_attempts: self.worker.max_attempts.max(1),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::parse_from(["casebook-server"]);
        assert!(config.command.is_none());
        assert_eq!(config.addr().port(), 3720);
        assert_eq!(config.service_config().session_ttl, chrono::Duration::hours(24));
        assert_eq!(config.worker.workers, 2);
    }

    #[test]
    fn subcommands_parse() {
        let config = ServerConfig::parse_from(["casebook-server", "cancel-job", "abc"]);
        assert!(matches!(config.command, Some(Command::CancelJob { ref id }) if id == "abc"));

        let config = ServerConfig::parse_from([
            "casebook-server",
            "summary",
            "--window-secs",
            "60",
        ]);
        assert!(matches!(
            config.command,
            Some(Command::Summary { window_secs: 60 })
        ));
    }

    #[test]
    fn queue_flags_flow_into_service_config() {
        let config = ServerConfig::parse_from([
            "casebook-server",
            "--max-attempts",
            "9",
            "--port",
            "8080",
            "--bind",
            "127.0.0.1",
        ]);
        assert_eq!(config.service_config().max_attempts, 9);
        assert_eq!(config.addr().to_string(), "127.0.0.1:8080");
    }
}
