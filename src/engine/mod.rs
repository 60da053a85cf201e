//! Proving engine capability
//!
//! The zero-knowledge engine is an external collaborator. Every operation is a
//! long, blocking call over filesystem artifacts, so implementations are
//! synchronous and callers run them on a blocking thread.

mod ezkl;

pub use ezkl::{EzklCli, EzklCliConfig};

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Failure reported by the engine.
///
/// The message is carried verbatim so it can be surfaced on the job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The operation ran and failed. Retrying will not help.
    #[error("{0}")]
    Failed(String),

    /// The engine could not be reached or was interrupted.
    #[error("{0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::Failed(msg) | EngineError::Unavailable(msg) => msg,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Shared flag that tells a running engine call to stop.
///
/// Clones observe the same flag. Subprocess-backed engines kill their child
/// when it trips.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Calibration objective passed to settings calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationTarget {
    #[default]
    Resources,
    Accuracy,
}

impl CalibrationTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationTarget::Resources => "resources",
            CalibrationTarget::Accuracy => "accuracy",
        }
    }
}

impl fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The eight primitive operations the pipeline and verifier need.
///
/// Every call receives a [`CancelToken`]; implementations should return
/// promptly once it is cancelled.
#[cfg_attr(test, automock)]
pub trait ProvingEngine: Send + Sync {
    /// Derive initial circuit settings from the model
    fn gen_settings(&self, model: &Path, settings: &Path, cancel: &CancelToken)
        -> EngineResult<()>;

    /// Tune settings against sample input, rewriting them in place
    fn calibrate_settings(
        &self,
        input: &Path,
        model: &Path,
        settings: &Path,
        target: CalibrationTarget,
        cancel: &CancelToken,
    ) -> EngineResult<()>;

    fn compile_circuit(
        &self,
        model: &Path,
        compiled: &Path,
        settings: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()>;

    /// Fetch or generate the structured reference string sized by the settings
    fn get_srs(&self, srs: &Path, settings: &Path, cancel: &CancelToken) -> EngineResult<()>;

    /// Generate the proving and verifying keys
    fn setup(
        &self,
        compiled: &Path,
        vk: &Path,
        pk: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()>;

    fn gen_witness(
        &self,
        input: &Path,
        compiled: &Path,
        witness: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()>;

    fn prove(
        &self,
        witness: &Path,
        compiled: &Path,
        pk: &Path,
        proof: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()>;

    /// Returns whether the proof is valid. An invalid proof is `Ok(false)`, not an error.
    fn verify(
        &self,
        proof: &Path,
        settings: &Path,
        vk: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let watcher = token.clone();
        assert!(!watcher.is_cancelled());
        token.cancel();
        assert!(watcher.is_cancelled());
    }
}
