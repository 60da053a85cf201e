//! Infrastructure layer for the prover
//!
//! Contains trait definitions and implementations for:
//! - Persistence (SQLite)
//! - Setup artifact cache (content-addressed directories)
//! - Background task runner (bounded worker pool with retries)
//! - Retention sweeps (job directory cleanup)
//! - Graceful shutdown (task draining)

mod cache;
mod error;
mod graceful_shutdown;
mod retention;
pub mod retry;
pub mod sqlite;
mod task_runner;
mod traits;

pub use cache::{ArtifactCache, ArtifactSet, CacheEntryInfo, CacheStats, PopulateOutcome};
pub use error::*;
pub use graceful_shutdown::{
    shutdown_signal, ShutdownConfig, ShutdownCoordinator, ShutdownSignal,
};
pub use retention::{spawn_retention_sweeper, RetentionConfig, RetentionSweeper, SweepReport};
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use sqlite::SqliteStore;
pub use task_runner::{spawn_task_runner, RunnerMessage, TaskQueue, TaskRunner, TaskRunnerConfig};
pub use traits::*;
