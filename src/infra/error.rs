//! Error types for the prover infrastructure

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use super::retry::is_retryable_db_error;
use crate::domain::JobStatus;
use crate::engine::EngineError;
use crate::pipeline::Stage;

/// How an error should be handled by callers.
///
/// The task runner retries only `Transient`; the API maps the rest onto
/// HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request content: unsupported format, duplicate model, bad input
    Validation,
    /// Caller may not see or act on the resource
    Access,
    NotFound,
    /// Too many active jobs; the caller should try again later
    Quota,
    /// Connectivity, timeouts, lock contention
    Transient,
    /// Computation or data failure that will not succeed on retry
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Access => "access",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Quota => "quota",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the prover
#[derive(Error, Debug)]
pub enum ProverError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Model not found
    #[error("model not found: {0}")]
    ModelNotFound(Uuid),

    /// Proof job not found
    #[error("proof job not found: {0}")]
    JobNotFound(Uuid),

    /// Request rejected before any work was done
    #[error("validation error: {0}")]
    Validation(String),

    /// Model content already registered
    #[error("a model with identical weights already exists: {fingerprint}")]
    DuplicateModel { fingerprint: String },

    /// Caller lacks access to the resource
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Too many active jobs for the submitting user
    #[error("too many active proof jobs: {active} pending or processing (limit {limit})")]
    QuotaExceeded { active: u32, limit: u32 },

    /// A status write that the job state machine does not allow
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// A pipeline stage failed; the engine message is kept verbatim
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: EngineError,
    },

    /// Engine failure outside the pipeline, e.g. during verification
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Soft or hard job deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Artifact cache misuse or corruption
    #[error("artifact cache error: {0}")]
    Cache(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProverError {
    /// Classify this error. Retry decisions use this and nothing else.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProverError::Database(e) => {
                if is_retryable_db_error(e) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            ProverError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            ProverError::Stage { source, .. } | ProverError::Engine(source) => {
                if source.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            ProverError::ModelNotFound(_) | ProverError::JobNotFound(_) => ErrorKind::NotFound,
            ProverError::Validation(_) | ProverError::DuplicateModel { .. } => {
                ErrorKind::Validation
            }
            ProverError::AccessDenied(_) => ErrorKind::Access,
            ProverError::QuotaExceeded { .. } => ErrorKind::Quota,
            ProverError::Serialization(_)
            | ProverError::InvalidStateTransition { .. }
            | ProverError::Timeout(_)
            | ProverError::Cache(_)
            | ProverError::Configuration(_)
            | ProverError::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn stage(stage: Stage, source: EngineError) -> Self {
        ProverError::Stage { stage, source }
    }
}

/// Result type for prover operations
pub type Result<T> = std::result::Result<T, ProverError>;
