pub mod config;
pub mod executor;
pub mod worker;

pub use config::{WorkerConfig, WorkerOptions};
pub use executor::JobExecutor;
pub use worker::{spawn_pool, RunOutcome, Worker};
