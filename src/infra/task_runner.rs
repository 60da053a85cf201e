//! Background proof-job runner
//!
//! Jobs are durable rows in `proof_jobs`; the runner only keeps an in-memory
//! notion of what is currently in flight. On start-up (and on every poll tick)
//! it picks up anything still `PENDING` or `PROCESSING`, so jobs interrupted
//! by a crash resume on the next start.
//!
//! # Configuration
//!
//! - `WORKER_COUNT` - Concurrent pipelines (default: 1)
//! - `JOB_HARD_TIMEOUT_SECS` - Kill an attempt after this long (default: 7200)
//! - `JOB_SOFT_TIMEOUT_SECS` - Stop at the next stage boundary after this long (default: 6000)
//! - `QUEUE_POLL_INTERVAL_SECS` - How often to rescan the job table (default: 30)
//! - `RETRY_*` - Attempt backoff, see [`RetryConfig::proof_job_from_env`]
//!
//! Both time limits count from the moment a job holds a worker slot, not from submission.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{AttemptStart, JobId, JobLayout};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pipeline::{PipelineContext, PipelineOutput, ProofPipeline, StageDeadline};

use super::retry::{Retry, RetryConfig};
use super::{JobStore, ModelStore, ProverError, Result};

/// Configuration for the task runner
#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// Number of pipelines allowed to run at once
    pub worker_count: usize,
    /// Ceiling on a single attempt; the job fails permanently when hit
    pub hard_timeout: Duration,
    /// Checked by the pipeline between stages
    pub soft_timeout: Duration,
    /// Backoff between attempts of one job
    pub retry: RetryConfig,
    /// How often to rescan the job table for work missed by notifications
    pub poll_interval: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            hard_timeout: Duration::from_secs(7200),
            soft_timeout: Duration::from_secs(6000),
            retry: RetryConfig::proof_job(),
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl TaskRunnerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_count = std::env::var("WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.worker_count);

        let hard_timeout = std::env::var("JOB_HARD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.hard_timeout);

        let soft_timeout = std::env::var("JOB_SOFT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.soft_timeout);

        let poll_interval = std::env::var("QUEUE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        Self {
            worker_count,
            hard_timeout,
            soft_timeout,
            retry: RetryConfig::proof_job_from_env(),
            poll_interval,
        }
    }
}

/// Message types for runner control
#[derive(Debug)]
pub enum RunnerMessage {
    /// A job was just created
    Enqueue(JobId),
    /// Rescan the job table now
    Recover,
}

/// Cloneable handle used to hand new jobs to the runner
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<RunnerMessage>,
}

impl TaskQueue {
    /// Notify the runner of a new job. The job row is the source of truth;
    /// a lost notification is picked up by the next poll.
    pub fn enqueue(&self, job_id: JobId) {
        if self.tx.send(RunnerMessage::Enqueue(job_id)).is_err() {
            warn!(job_id = %job_id, "task runner stopped, job will run after restart");
        }
    }

    pub fn recover(&self) {
        let _ = self.tx.send(RunnerMessage::Recover);
    }

    /// A queue with no runner behind it, for tools that never execute jobs
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// How a single attempt ended
enum AttemptOutcome {
    Finished(PipelineOutput),
    /// The job reached a terminal state before this attempt began
    AlreadyTerminal,
    /// Shutdown began while waiting for a worker slot
    Interrupted,
}

struct Shared {
    config: TaskRunnerConfig,
    jobs: Arc<dyn JobStore>,
    models: Arc<dyn ModelStore>,
    pipeline: Arc<ProofPipeline>,
    metrics: Arc<MetricsRegistry>,
    slots: Arc<Semaphore>,
    in_flight: Mutex<HashSet<JobId>>,
    shutdown: watch::Receiver<bool>,
}

/// Dispatches queued jobs onto a bounded pool of blocking workers
pub struct TaskRunner {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<RunnerMessage>,
    queue_rx: mpsc::UnboundedReceiver<RunnerMessage>,
}

impl TaskRunner {
    pub fn new(
        config: TaskRunnerConfig,
        jobs: Arc<dyn JobStore>,
        models: Arc<dyn ModelStore>,
        pipeline: Arc<ProofPipeline>,
        metrics: Arc<MetricsRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.worker_count));
        Self {
            shared: Arc::new(Shared {
                config,
                jobs,
                models,
                pipeline,
                metrics,
                slots,
                in_flight: Mutex::new(HashSet::new()),
                shutdown,
            }),
            queue_tx,
            queue_rx,
        }
    }

    /// Get a handle for enqueueing jobs
    pub fn queue(&self) -> TaskQueue {
        TaskQueue {
            tx: self.queue_tx.clone(),
        }
    }

    /// Run the dispatcher until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            workers = self.shared.config.worker_count,
            hard_timeout_secs = self.shared.config.hard_timeout.as_secs(),
            soft_timeout_secs = self.shared.config.soft_timeout.as_secs(),
            max_attempts = self.shared.config.retry.max_attempts(),
            "Starting proof task runner"
        );

        let mut shutdown = self.shared.shutdown.clone();
        // First tick fires immediately and performs start-up recovery
        let mut ticker = interval(self.shared.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.recover().await,
                Some(msg) = self.queue_rx.recv() => match msg {
                    RunnerMessage::Enqueue(job_id) => {
                        self.dispatch(job_id);
                    }
                    RunnerMessage::Recover => self.recover().await,
                },
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("proof task runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Re-dispatch every job left pending or processing
    async fn recover(&self) {
        match self.shared.jobs.recoverable_jobs().await {
            Ok(ids) => {
                let mut recovered = 0u64;
                for id in ids {
                    if self.dispatch(id) {
                        recovered += 1;
                    }
                }
                if recovered > 0 {
                    info!(count = recovered, "recovered unfinished proof jobs");
                    self.shared
                        .metrics
                        .add_counter(metric_names::JOBS_RECOVERED, recovered)
                        .await;
                }
            }
            Err(e) => error!(error = %e, "failed to scan for unfinished jobs"),
        }
    }

    /// Start a job unless it is already in flight. Returns whether it was started.
    fn dispatch(&self, job_id: JobId) -> bool {
        if !self.shared.mark_in_flight(job_id) {
            debug!(job_id = %job_id, "job already in flight");
            return false;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.process_job(job_id).await;
            shared.clear_in_flight(&job_id);
        });
        true
    }
}

impl Shared {
    fn mark_in_flight(&self, job_id: JobId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id)
    }

    fn clear_in_flight(&self, job_id: &JobId) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    async fn process_job(&self, job_id: JobId) {
        let task_id = Uuid::new_v4().to_string();
        let max_attempts = self.config.retry.max_attempts();
        let started = Instant::now();

        for attempt in 1..=max_attempts {
            if *self.shutdown.borrow() {
                info!(job_id = %job_id, "shutdown requested, leaving job for recovery");
                return;
            }

            let result = self.run_attempt(job_id, &task_id).await;

            let err = match result {
                Ok(AttemptOutcome::AlreadyTerminal) => return,
                Ok(AttemptOutcome::Interrupted) => {
                    info!(job_id = %job_id, "shutdown requested, leaving job for recovery");
                    return;
                }
                Ok(AttemptOutcome::Finished(output)) => {
                    self.finish_success(job_id, output, started).await;
                    return;
                }
                Err(e) => e,
            };

            if err.is_transient() && attempt < max_attempts {
                let message = format!("Retry {attempt}: {err}");
                warn!(job_id = %job_id, attempt, error = %err, "transient failure, retrying");
                self.metrics.inc_counter(metric_names::JOBS_RETRIED).await;

                if let Err(e) = self
                    .persist("record_retry", || self.jobs.record_retry(&job_id, &message))
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to record retry");
                }

                let delay = self.config.retry.delay_for_attempt(attempt - 1);
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    Ok(()) = shutdown.changed() => {
                        info!(job_id = %job_id, "shutdown during backoff, leaving job for recovery");
                        return;
                    }
                }
                continue;
            }

            self.finish_failure(job_id, &err).await;
            return;
        }
    }

    async fn run_attempt(&self, job_id: JobId, task_id: &str) -> Result<AttemptOutcome> {
        // A job only starts, and its time limits only begin, once it holds a worker slot.
        // The permit moves into the blocking closure: an abandoned run keeps its slot until it stops.
        let permit: OwnedSemaphorePermit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProverError::Internal("worker pool closed".to_string()))?;

        if *self.shutdown.borrow() {
            return Ok(AttemptOutcome::Interrupted);
        }

        match self.jobs.begin_attempt(&job_id, task_id).await? {
            AttemptStart::Started => {}
            AttemptStart::AlreadyCompleted | AttemptStart::AlreadyFailed => {
                debug!(job_id = %job_id, "job already finished, nothing to do");
                return Ok(AttemptOutcome::AlreadyTerminal);
            }
        }

        let job = self
            .jobs
            .get_job(&job_id)
            .await?
            .ok_or(ProverError::JobNotFound(job_id.0))?;
        let model = self
            .models
            .get_model(&job.model_id)
            .await?
            .ok_or(ProverError::ModelNotFound(job.model_id.0))?;

        // A cache hit never reads the model, so check it is still there
        if !model.storage_path.is_file() {
            return Err(ProverError::Validation(format!(
                "model file not found: {}",
                model.storage_path.display()
            )));
        }

        let job_dir = job
            .input_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| ProverError::Internal(format!("job {job_id} has no directory")))?;

        let ctx = PipelineContext {
            job_id,
            model_path: model.storage_path,
            model_fingerprint: model.fingerprint,
            layout: JobLayout::at(job_dir),
            deadline: StageDeadline::new(Some(self.config.soft_timeout)),
        };
        let deadline = ctx.deadline.clone();
        self.update_busy_gauge().await;

        info!(job_id = %job_id, task_id, "proof attempt started");
        let pipeline = self.pipeline.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = permit;
            pipeline.run(&ctx)
        });

        let result = self.await_with_hard_timeout(job_id, handle, &deadline).await;
        self.update_busy_gauge().await;
        result.map(AttemptOutcome::Finished)
    }

    async fn await_with_hard_timeout(
        &self,
        job_id: JobId,
        handle: JoinHandle<Result<PipelineOutput>>,
        deadline: &StageDeadline,
    ) -> Result<PipelineOutput> {
        match tokio::time::timeout(self.config.hard_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ProverError::Internal(format!(
                "pipeline task aborted: {join_err}"
            ))),
            Err(_) => {
                // Kills the running engine call, which releases the worker slot
                deadline.cancel();
                warn!(
                    job_id = %job_id,
                    limit_secs = self.config.hard_timeout.as_secs(),
                    "proof attempt exceeded hard time limit"
                );
                self.metrics.inc_counter(metric_names::JOBS_TIMED_OUT).await;
                Err(ProverError::Timeout(format!(
                    "exceeded hard time limit of {:?}",
                    self.config.hard_timeout
                )))
            }
        }
    }

    async fn finish_success(&self, job_id: JobId, output: PipelineOutput, started: Instant) {
        for timing in &output.stage_timings {
            self.metrics
                .observe_duration(
                    &metric_names::pipeline_stage(timing.stage.as_str()),
                    timing.elapsed.as_secs_f64(),
                )
                .await;
        }
        self.metrics
            .observe_duration(metric_names::JOB_DURATION, started.elapsed().as_secs_f64())
            .await;
        let cache_metric = if output.cache_hit {
            metric_names::CACHE_HITS
        } else {
            metric_names::CACHE_MISSES
        };
        self.metrics.inc_counter(cache_metric).await;

        match self
            .persist("complete_job", || {
                self.jobs
                    .complete_job(&job_id, &output.artifacts, output.cache_hit)
            })
            .await
        {
            Ok(()) => {
                self.metrics.inc_counter(metric_names::JOBS_COMPLETED).await;
                info!(job_id = %job_id, cache_hit = output.cache_hit, "proof job completed");
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to record completed job"),
        }
    }

    async fn finish_failure(&self, job_id: JobId, err: &ProverError) {
        let message = err.to_string();
        error!(job_id = %job_id, kind = %err.kind(), error = %message, "proof job failed");

        match self
            .persist("fail_job", || self.jobs.fail_job(&job_id, &message))
            .await
        {
            Ok(()) => self.metrics.inc_counter(metric_names::JOBS_FAILED).await,
            Err(e) => error!(job_id = %job_id, error = %e, "failed to record job failure"),
        }
    }

    /// Retry a store write while the database reports transient errors
    async fn persist<F, Fut>(&self, context: &str, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        Retry::new(RetryConfig::database())
            .run_with_predicate(context, op, ProverError::is_transient)
            .await
            .into_result()
    }

    async fn update_busy_gauge(&self) {
        let busy = self
            .config
            .worker_count
            .saturating_sub(self.slots.available_permits());
        self.metrics
            .set_gauge(metric_names::WORKERS_BUSY, busy as u64)
            .await;
    }
}

/// Spawn the task runner as a background task
pub fn spawn_task_runner(runner: TaskRunner) -> (JoinHandle<()>, TaskQueue) {
    let queue = runner.queue();
    let handle = tokio::spawn(runner.run());
    (handle, queue)
}
