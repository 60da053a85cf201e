//! Proof jobs and their lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{JobId, ModelId, UserId};

/// Lifecycle status of a proof job.
///
/// ```text
/// PENDING ──> PROCESSING ──> COMPLETED
///                 │ ↺
///                 └────────> FAILED
/// ```
///
/// `PROCESSING -> PROCESSING` is the re-entry taken by a retried attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Counted against the per-user submission quota
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The single rule every status write is checked against
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Every status a job may move to `next` from
    pub fn sources(next: JobStatus) -> impl Iterator<Item = JobStatus> {
        Self::ALL
            .into_iter()
            .filter(move |from| from.can_transition_to(next))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Filesystem locations of everything a job produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub compiled_circuit: Option<PathBuf>,
    pub settings: Option<PathBuf>,
    pub proving_key: Option<PathBuf>,
    pub verifying_key: Option<PathBuf>,
    pub srs: Option<PathBuf>,
    pub witness: Option<PathBuf>,
    pub proof: Option<PathBuf>,
}

impl ArtifactPaths {
    pub fn is_empty(&self) -> bool {
        *self == ArtifactPaths::default()
    }
}

/// A single request to prove one input against one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofJob {
    pub id: JobId,
    pub model_id: ModelId,
    pub user_id: UserId,
    /// SHA-256 of the canonical JSON of the submitted input
    pub input_hash: String,
    pub input_path: PathBuf,
    pub status: JobStatus,
    pub artifacts: ArtifactPaths,
    /// True when setup artifacts were restored from the cache
    pub cache_hit: bool,
    pub error_message: Option<String>,
    /// Correlation id of the attempt that last touched the job
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProofJob {
    /// Create a new job in `PENDING`
    pub fn new(
        id: JobId,
        model_id: ModelId,
        user_id: UserId,
        input_hash: String,
        input_path: PathBuf,
    ) -> Self {
        Self {
            id,
            model_id,
            user_id,
            input_hash,
            input_path,
            status: JobStatus::Pending,
            artifacts: ArtifactPaths::default(),
            cache_hit: false,
            error_message: None,
            task_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn proof_available(&self) -> bool {
        self.status == JobStatus::Completed && self.artifacts.proof.is_some()
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            error_message: self.error_message.clone(),
            proof_available: self.proof_available(),
        }
    }
}

/// Lightweight status answer for polling clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub proof_available: bool,
}

/// Outcome of trying to start an attempt on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStart {
    /// The job is now `PROCESSING` and owned by this attempt
    Started,
    /// A previous attempt already finished the job
    AlreadyCompleted,
    AlreadyFailed,
}
