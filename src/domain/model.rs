//! Registered model entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ModelId, UserId};

/// Largest model file accepted for registration (5 GiB)
pub const MAX_MODEL_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Declared serialization format of a model file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Onnx,
    Pytorch,
    Tensorflow,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Onnx => "onnx",
            ModelFormat::Pytorch => "pytorch",
            ModelFormat::Tensorflow => "tensorflow",
        }
    }

    /// File extensions accepted for this format (lowercase, no dot)
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ModelFormat::Onnx => &["onnx"],
            ModelFormat::Pytorch => &["pt", "pth"],
            ModelFormat::Tensorflow => &["h5", "pb"],
        }
    }

    /// Only ONNX graphs can be compiled into circuits
    pub fn supports_proving(&self) -> bool {
        matches!(self, ModelFormat::Onnx)
    }

    /// Whether a Merkle root over weight chunks is computed at registration
    pub fn computes_merkle_root(&self) -> bool {
        matches!(self, ModelFormat::Onnx)
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "onnx" => Ok(ModelFormat::Onnx),
            "pytorch" => Ok(ModelFormat::Pytorch),
            "tensorflow" => Ok(ModelFormat::Tensorflow),
            other => Err(format!("unknown model format: {other}")),
        }
    }
}

/// A registered model.
///
/// Immutable after registration except for `is_public`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: ModelId,
    pub owner: UserId,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub format: ModelFormat,
    /// SHA-256 of the model file, lowercase hex
    pub fingerprint: String,
    pub merkle_root: Option<String>,
    pub size_bytes: u64,
    pub storage_path: PathBuf,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl ModelEntry {
    /// Private models are only visible to their owner
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        self.is_public || self.owner == *user
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        self.owner == *user
    }
}

/// Registration request for a model file already present on the server
#[derive(Debug, Clone, Deserialize)]
pub struct NewModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub format: ModelFormat,
    pub source_path: PathBuf,
    #[serde(default)]
    pub is_public: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Filters for model listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelFilter {
    pub owner: Option<UserId>,
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub public_only: bool,
}
