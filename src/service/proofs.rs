//! Proof submission, status queries and verification

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::crypto::canonical_json_hash;
use crate::domain::{
    JobId, JobLayout, JobStatus, JobStatusView, ModelId, Page, Paged, ProofJob, UserId,
    VerificationRecord,
};
use crate::engine::{CancelToken, ProvingEngine};
use crate::infra::{
    JobStore, ModelStore, ProverError, Result, TaskQueue, VerificationStore,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// Settings for [`ProofService`]
#[derive(Debug, Clone)]
pub struct ProofServiceConfig {
    /// Root of the per-job directories
    pub proofs_dir: PathBuf,
    /// Pending plus processing jobs allowed per user
    pub max_active_jobs: u32,
}

impl ProofServiceConfig {
    pub fn new(proofs_dir: impl Into<PathBuf>) -> Self {
        Self {
            proofs_dir: proofs_dir.into(),
            max_active_jobs: 10,
        }
    }
}

/// A request to prove one input against one model
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitProof {
    pub model_id: ModelId,
    pub input_data: Value,
    /// Expected model output, passed through to the witness generator
    #[serde(default)]
    pub output_data: Option<Value>,
}

impl SubmitProof {
    /// The document written to `input.json`
    fn input_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("input_data".into(), self.input_data.clone());
        if let Some(output) = &self.output_data {
            doc.insert("output_data".into(), output.clone());
        }
        Value::Object(doc)
    }
}

pub struct ProofService {
    jobs: Arc<dyn JobStore>,
    models: Arc<dyn ModelStore>,
    verifications: Arc<dyn VerificationStore>,
    engine: Arc<dyn ProvingEngine>,
    queue: TaskQueue,
    metrics: Arc<MetricsRegistry>,
    config: ProofServiceConfig,
}

impl ProofService {
    pub fn new(
        config: ProofServiceConfig,
        jobs: Arc<dyn JobStore>,
        models: Arc<dyn ModelStore>,
        verifications: Arc<dyn VerificationStore>,
        engine: Arc<dyn ProvingEngine>,
        queue: TaskQueue,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            jobs,
            models,
            verifications,
            engine,
            queue,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &ProofServiceConfig {
        &self.config
    }

    /// Create a `PENDING` job and hand it to the task runner.
    ///
    /// The input file is in place before the row exists, and the directory is
    /// removed again if the row is rejected.
    #[instrument(skip(self, request), fields(user_id = %user, model_id = %request.model_id))]
    pub async fn submit(&self, user: UserId, request: SubmitProof) -> Result<ProofJob> {
        let model = self
            .models
            .get_model(&request.model_id)
            .await?
            .ok_or(ProverError::ModelNotFound(request.model_id.0))?;
        if !model.is_visible_to(&user) {
            return Err(ProverError::AccessDenied("access denied to private model".into()));
        }
        if !model.format.supports_proving() {
            return Err(ProverError::Validation(
                "only ONNX models are supported for proof generation".into(),
            ));
        }
        if request.input_data.is_null() {
            return Err(ProverError::Validation("input_data is required".into()));
        }

        let limit = self.config.max_active_jobs;
        let active = self.jobs.count_active_jobs(&user).await?;
        if active >= limit {
            self.metrics.inc_counter(metric_names::JOBS_REJECTED).await;
            return Err(ProverError::QuotaExceeded { active, limit });
        }

        let document = request.input_document();
        let input_hash = canonical_json_hash(&document)?;

        let job_id = JobId::new();
        let layout = JobLayout::new(&self.config.proofs_dir, &job_id);
        let dir = layout.dir().to_path_buf();
        let input_path = layout.input();

        {
            let dir = dir.clone();
            let input_path = input_path.clone();
            tokio::task::spawn_blocking(move || write_input(&dir, &input_path, &document))
                .await
                .map_err(|e| ProverError::Internal(format!("input write aborted: {e}")))??;
        }

        let job = ProofJob::new(job_id, model.id, user, input_hash, input_path);
        if let Err(e) = self.jobs.create_job(&job, limit).await {
            if matches!(e, ProverError::QuotaExceeded { .. }) {
                self.metrics.inc_counter(metric_names::JOBS_REJECTED).await;
            }
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!(job_id = %job_id, error = %cleanup, "failed to remove rejected job directory");
            }
            return Err(e);
        }

        self.queue.enqueue(job.id);
        self.metrics.inc_counter(metric_names::JOBS_SUBMITTED).await;
        info!(job_id = %job.id, input_hash = %job.input_hash, "proof job submitted");

        Ok(job)
    }

    pub async fn status(&self, id: &JobId, user: &UserId) -> Result<JobStatusView> {
        Ok(self.owned_job(id, user).await?.status_view())
    }

    pub async fn job(&self, id: &JobId, user: &UserId) -> Result<ProofJob> {
        self.owned_job(id, user).await
    }

    /// The user's jobs, newest first
    pub async fn list(&self, user: &UserId, page: Page) -> Result<Paged<ProofJob>> {
        self.jobs.list_jobs(user, page).await
    }

    /// Verify a completed proof and append the outcome.
    ///
    /// An engine failure is returned as an error and records nothing; an
    /// invalid proof is a successful call with `is_valid = false`.
    #[instrument(skip(self), fields(job_id = %id, verifier = %user))]
    pub async fn verify(&self, id: &JobId, user: &UserId) -> Result<VerificationRecord> {
        let job = self.verifiable_job(id, user).await?;
        if job.status != JobStatus::Completed {
            return Err(ProverError::Validation(format!(
                "cannot verify proof with status: {}",
                job.status
            )));
        }

        let artifacts = &job.artifacts;
        let (Some(proof), Some(settings), Some(vk), Some(srs)) = (
            artifacts.proof.clone(),
            artifacts.settings.clone(),
            artifacts.verifying_key.clone(),
            artifacts.srs.clone(),
        ) else {
            return Err(ProverError::Validation(
                "proof artifacts are no longer available".into(),
            ));
        };

        let engine = Arc::clone(&self.engine);
        let started = Instant::now();
        let is_valid = tokio::task::spawn_blocking(move || {
            engine.verify(&proof, &settings, &vk, &srs, &CancelToken::new())
        })
        .await
        .map_err(|e| ProverError::Internal(format!("verification task aborted: {e}")))??;
        let elapsed = started.elapsed();

        let record = VerificationRecord::new(
            job.id,
            job.model_id,
            *user,
            is_valid,
            elapsed.as_millis() as u64,
        );
        self.verifications.insert_verification(&record).await?;

        let counter = if is_valid {
            metric_names::VERIFICATIONS_VALID
        } else {
            metric_names::VERIFICATIONS_INVALID
        };
        self.metrics.inc_counter(counter).await;
        self.metrics
            .observe_histogram(metric_names::VERIFY_LATENCY, elapsed.as_secs_f64())
            .await;

        info!(is_valid, latency_ms = record.latency_ms, "proof verified");
        Ok(record)
    }

    /// Verification history of a job, oldest first
    pub async fn verifications(
        &self,
        id: &JobId,
        user: &UserId,
    ) -> Result<Vec<VerificationRecord>> {
        let job = self.verifiable_job(id, user).await?;
        self.verifications.list_verifications(&job.id).await
    }

    async fn load_job(&self, id: &JobId) -> Result<ProofJob> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or(ProverError::JobNotFound(id.0))
    }

    /// Jobs are readable only by their submitter
    async fn owned_job(&self, id: &JobId, user: &UserId) -> Result<ProofJob> {
        let job = self.load_job(id).await?;
        if job.user_id != *user {
            return Err(ProverError::AccessDenied(
                "access denied to this proof job".into(),
            ));
        }
        Ok(job)
    }

    /// The submitter may verify, and so may anyone when the model is public
    async fn verifiable_job(&self, id: &JobId, user: &UserId) -> Result<ProofJob> {
        let job = self.load_job(id).await?;
        if job.user_id == *user {
            return Ok(job);
        }
        let public = self
            .models
            .get_model(&job.model_id)
            .await?
            .map(|m| m.is_public)
            .unwrap_or(false);
        if !public {
            return Err(ProverError::AccessDenied(
                "access denied to this proof job".into(),
            ));
        }
        Ok(job)
    }
}

/// Write `input.json` through a temp file so a partial file is never visible
fn write_input(dir: &Path, path: &Path, document: &Value) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, document)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| ProverError::Io(e.error))?;
    Ok(())
}
