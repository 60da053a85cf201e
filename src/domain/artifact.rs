//! On-disk artifact names and per-job directory layout

use std::path::{Path, PathBuf};

use super::{ArtifactPaths, JobId};

pub const INPUT_FILE: &str = "input.json";
pub const COMPILED_CIRCUIT_FILE: &str = "network.ezkl";
pub const SETTINGS_FILE: &str = "settings.json";
pub const PROVING_KEY_FILE: &str = "pk.key";
pub const VERIFYING_KEY_FILE: &str = "vk.key";
pub const SRS_FILE: &str = "kzg.srs";
pub const WITNESS_FILE: &str = "witness.json";
pub const PROOF_FILE: &str = "proof.json";

/// The setup-stage outputs that depend only on the model, never on the input.
/// These are what the artifact cache stores.
pub const SETUP_ARTIFACTS: [&str; 5] = [
    COMPILED_CIRCUIT_FILE,
    SETTINGS_FILE,
    PROVING_KEY_FILE,
    VERIFYING_KEY_FILE,
    SRS_FILE,
];

/// Paths inside `<proofs_dir>/<job_id>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    dir: PathBuf,
}

impl JobLayout {
    pub fn new(proofs_dir: impl AsRef<Path>, job_id: &JobId) -> Self {
        Self {
            dir: proofs_dir.as_ref().join(job_id.to_string()),
        }
    }

    /// Layout for a directory that already exists, e.g. recovered from a stored input path
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    pub fn compiled_circuit(&self) -> PathBuf {
        self.dir.join(COMPILED_CIRCUIT_FILE)
    }

    pub fn settings(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub fn proving_key(&self) -> PathBuf {
        self.dir.join(PROVING_KEY_FILE)
    }

    pub fn verifying_key(&self) -> PathBuf {
        self.dir.join(VERIFYING_KEY_FILE)
    }

    pub fn srs(&self) -> PathBuf {
        self.dir.join(SRS_FILE)
    }

    pub fn witness(&self) -> PathBuf {
        self.dir.join(WITNESS_FILE)
    }

    pub fn proof(&self) -> PathBuf {
        self.dir.join(PROOF_FILE)
    }

    /// Every artifact path, as recorded on a completed job
    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths {
            compiled_circuit: Some(self.compiled_circuit()),
            settings: Some(self.settings()),
            proving_key: Some(self.proving_key()),
            verifying_key: Some(self.verifying_key()),
            srs: Some(self.srs()),
            witness: Some(self.witness()),
            proof: Some(self.proof()),
        }
    }
}
