//! Trait definitions for the prover's persistent stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    ArtifactPaths, AttemptStart, JobId, ModelEntry, ModelFilter, ModelId, Page, Paged, ProofJob,
    UserId, VerificationRecord,
};

use super::Result;

/// Proof job persistence. The `proof_jobs` table doubles as the durable work queue.
///
/// Every status write is checked against [`crate::domain::JobStatus::can_transition_to`];
/// a disallowed write fails with `InvalidStateTransition` and changes nothing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `PENDING` job unless the user already has `max_active`
    /// pending or processing jobs. The count and insert are atomic.
    async fn create_job(&self, job: &ProofJob, max_active: u32) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<ProofJob>>;

    /// A user's jobs, newest first
    async fn list_jobs(&self, user: &UserId, page: Page) -> Result<Paged<ProofJob>>;

    /// Pending plus processing jobs for a user
    async fn count_active_jobs(&self, user: &UserId) -> Result<u32>;

    /// Move the job to `PROCESSING` for a new attempt, unless it already finished
    async fn begin_attempt(&self, id: &JobId, task_id: &str) -> Result<AttemptStart>;

    /// Record the error that caused a retry while the job stays `PROCESSING`
    async fn record_retry(&self, id: &JobId, message: &str) -> Result<()>;

    async fn complete_job(&self, id: &JobId, artifacts: &ArtifactPaths, cache_hit: bool)
        -> Result<()>;

    async fn fail_job(&self, id: &JobId, message: &str) -> Result<()>;

    /// Jobs left `PENDING` or `PROCESSING`, oldest first
    async fn recoverable_jobs(&self) -> Result<Vec<JobId>>;

    /// Completed jobs older than `cutoff` that still reference artifacts
    async fn completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProofJob>>;

    /// Forget artifact paths after their files were removed
    async fn clear_artifacts(&self, id: &JobId) -> Result<()>;
}

/// Model registry persistence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Insert a model. Duplicate fingerprints fail with `DuplicateModel`.
    async fn insert_model(&self, model: &ModelEntry) -> Result<()>;

    async fn get_model(&self, id: &ModelId) -> Result<Option<ModelEntry>>;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ModelEntry>>;

    async fn find_by_owner_and_name(&self, owner: &UserId, name: &str)
        -> Result<Option<ModelEntry>>;

    /// Models visible to `viewer` matching `filter`, newest first
    async fn list_models(
        &self,
        viewer: &UserId,
        filter: &ModelFilter,
        page: Page,
    ) -> Result<Paged<ModelEntry>>;

    async fn set_visibility(&self, id: &ModelId, is_public: bool) -> Result<()>;
}

/// Append-only verification history
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert_verification(&self, record: &VerificationRecord) -> Result<()>;

    /// Verifications of one job, oldest first
    async fn list_verifications(&self, job_id: &JobId) -> Result<Vec<VerificationRecord>>;
}
