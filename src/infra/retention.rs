//! Periodic cleanup of old job directories
//!
//! Completed jobs keep their rows forever; only their on-disk artifacts are
//! removed once they are older than the retention window. Cached setup
//! artifacts live elsewhere and are never touched here.
//!
//! # Configuration
//!
//! - `RETENTION_DAYS` - Age after which completed job files are removed (default: 7)
//! - `RETENTION_INTERVAL_SECS` - How often to sweep (default: 86400)

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::metrics::{metric_names, MetricsRegistry};

use super::{JobStore, ProverError, Result};

/// Configuration for the retention sweeper
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Completed jobs older than this lose their files
    pub retention: Duration,
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl RetentionConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let retention = std::env::var("RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .and_then(retention_from_days)
            .unwrap_or(defaults.retention);

        let interval = std::env::var("RETENTION_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        Self {
            retention,
            interval,
        }
    }
}

/// `None` when the window does not fit in a `Duration`
fn retention_from_days(days: u64) -> Option<Duration> {
    days.checked_mul(24 * 3600).map(Duration::from_secs)
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cleaned: u64,
    pub freed_bytes: u64,
}

pub struct RetentionSweeper {
    config: RetentionConfig,
    jobs: Arc<dyn JobStore>,
    metrics: Arc<MetricsRegistry>,
}

impl RetentionSweeper {
    pub fn new(
        config: RetentionConfig,
        jobs: Arc<dyn JobStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            jobs,
            metrics,
        }
    }

    /// Remove files of every completed job past the retention window
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| ProverError::Configuration(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .ok_or_else(|| ProverError::Configuration("retention out of range".to_string()))?;

        let expired = self.jobs.completed_before(cutoff).await?;
        let mut report = SweepReport::default();

        for job in expired {
            let Some(dir) = job.input_path.parent().map(Path::to_path_buf) else {
                warn!(job_id = %job.id, "job has no directory, skipping");
                continue;
            };

            let removed = tokio::task::spawn_blocking(move || remove_job_dir(&dir))
                .await
                .map_err(|e| ProverError::Internal(format!("cleanup task aborted: {e}")))
                .and_then(|r| r.map_err(ProverError::from));

            let freed = match removed {
                Ok(freed) => freed,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to remove job directory");
                    continue;
                }
            };

            if let Err(e) = self.jobs.clear_artifacts(&job.id).await {
                error!(job_id = %job.id, error = %e, "failed to clear artifact paths");
                continue;
            }

            debug!(job_id = %job.id, freed_bytes = freed, "job artifacts removed");
            report.cleaned += 1;
            report.freed_bytes += freed;
        }

        if report.cleaned > 0 {
            info!(
                cleaned = report.cleaned,
                freed_bytes = report.freed_bytes,
                "retention sweep finished"
            );
        }
        self.metrics
            .add_counter(metric_names::RETENTION_JOBS_CLEANED, report.cleaned)
            .await;
        self.metrics
            .add_counter(metric_names::RETENTION_BYTES_FREED, report.freed_bytes)
            .await;

        Ok(report)
    }

    /// Sweep on every interval tick until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Starting retention sweeper"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "retention sweep failed");
                    }
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("retention sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn the sweeper as a background task
pub fn spawn_retention_sweeper(
    sweeper: RetentionSweeper,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(sweeper.run(shutdown))
}

/// Delete a job directory, returning the bytes it held. A missing directory frees nothing.
fn remove_job_dir(dir: &Path) -> io::Result<u64> {
    let size = match tree_size(dir) {
        Ok(size) => size,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

fn tree_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}
