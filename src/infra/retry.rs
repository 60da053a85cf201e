//! Retry utilities with exponential backoff and jitter
//!
//! Used at two levels:
//! - whole proof-job attempts, driven by the task runner with [`RetryConfig::delay_for_attempt`]
//! - individual database writes, wrapped in [`Retry::run_with_predicate`]
//!
//! Jitter spreads retries of many jobs that failed together so they do not
//! hammer a recovering database in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double each time)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0): the delay varies by up to this fraction either way
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryConfig {
    /// Create a config for fast retries (good for local/in-memory operations)
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }

    /// Create a config for SQLite writes contending on the database lock
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Whole proof-job attempts: 3 attempts in total, backoff capped at 10 minutes
    pub fn proof_job() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Proof-job policy with overrides from `RETRY_*` environment variables
    pub fn proof_job_from_env() -> Self {
        let defaults = Self::proof_job();

        let max_retries = std::env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(|attempts| attempts.saturating_sub(1))
            .unwrap_or(defaults.max_retries);

        let initial_delay = std::env::var("RETRY_INITIAL_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay);

        let max_delay = std::env::var("RETRY_MAX_DELAY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_delay);

        let jitter = std::env::var("RETRY_JITTER")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(defaults.jitter);

        defaults
            .with_max_retries(max_retries)
            .with_initial_delay(initial_delay)
            .with_max_delay(max_delay)
            .with_jitter(jitter)
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt (0-indexed).
    ///
    /// Never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(cap);

        let final_delay = if self.jitter > 0.0 && capped_delay > 0.0 {
            let jitter_range = capped_delay * self.jitter;
            let jitter_offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter_offset).clamp(0.0, cap)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, E>,
    /// Number of attempts made (1 = succeeded on first try)
    pub attempts: u32,
    /// Total time spent on retries (including delays)
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    /// Check if the operation succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Get the result, consuming self
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// A retry executor that can run operations with retry logic
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Create a new retry executor with the given config
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run an operation, retrying only errors accepted by `should_retry`
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        context: &str,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let start = std::time::Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(
                            context = context,
                            attempts = attempts,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => {
                    if attempts > self.config.max_retries || !should_retry(&e) {
                        if attempts > 1 {
                            tracing::warn!(
                                context = context,
                                attempts = attempts,
                                error = %e,
                                "Operation failed after retries"
                            );
                        }
                        return RetryResult {
                            result: Err(e),
                            attempts,
                            total_duration: start.elapsed(),
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);

                    tracing::debug!(
                        context = context,
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying operation after failure"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Check if a database error is worth retrying.
///
/// SQLite reports lock contention as `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6),
/// possibly as an extended code whose low byte is one of those.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        // Connection errors are usually transient
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false, // Pool is intentionally closed
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
