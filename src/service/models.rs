//! Model registration and lookup

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::crypto::{fingerprint, merkle_root, DEFAULT_CHUNK_SIZE};
use crate::domain::{
    ModelEntry, ModelFilter, ModelFormat, ModelId, NewModel, Page, Paged, UserId,
    MAX_MODEL_SIZE_BYTES,
};
use crate::infra::{ModelStore, ProverError, Result};
use crate::metrics::{metric_names, MetricsRegistry};

/// Registers models and enforces ownership and visibility rules
pub struct ModelRegistry {
    models: Arc<dyn ModelStore>,
    models_dir: PathBuf,
    metrics: Arc<MetricsRegistry>,
}

impl ModelRegistry {
    /// `models_dir` resolves relative source paths
    pub fn new(
        models: Arc<dyn ModelStore>,
        models_dir: impl Into<PathBuf>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            models,
            models_dir: models_dir.into(),
            metrics,
        }
    }

    /// Register a model file already present on the server.
    ///
    /// Rejects mismatched extensions, empty or oversized files, a name the
    /// owner already uses, and content that is already registered.
    #[instrument(skip(self, request), fields(owner = %owner, name = %request.name))]
    pub async fn register(&self, owner: UserId, request: NewModel) -> Result<ModelEntry> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ProverError::Validation("model name must not be empty".into()));
        }

        let path = self.resolve(&request.source_path);
        check_extension(&path, request.format)?;

        if self
            .models
            .find_by_owner_and_name(&owner, &name)
            .await?
            .is_some()
        {
            return Err(ProverError::Validation(format!(
                "a model named {name:?} is already registered"
            )));
        }

        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(ProverError::Validation(format!(
                    "{} is not a regular file",
                    path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProverError::Validation(format!(
                    "model file not found: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if size_bytes == 0 {
            return Err(ProverError::Validation("model file is empty".into()));
        }
        if size_bytes > MAX_MODEL_SIZE_BYTES {
            return Err(ProverError::Validation(format!(
                "model file is {size_bytes} bytes; the limit is {MAX_MODEL_SIZE_BYTES}"
            )));
        }

        let format = request.format;
        let hash_path = path.clone();
        let (digest, root) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let digest = fingerprint(&hash_path)?;
            let root = if format.computes_merkle_root() {
                Some(merkle_root(&hash_path, DEFAULT_CHUNK_SIZE)?)
            } else {
                None
            };
            Ok((digest, root))
        })
        .await
        .map_err(|e| ProverError::Internal(format!("hashing task aborted: {e}")))??;

        if self.models.find_by_fingerprint(&digest).await?.is_some() {
            return Err(ProverError::DuplicateModel {
                fingerprint: digest,
            });
        }

        let entry = ModelEntry {
            id: ModelId::new(),
            owner,
            name,
            description: request.description,
            version: request.version,
            format,
            fingerprint: digest,
            merkle_root: root,
            size_bytes,
            storage_path: path,
            is_public: request.is_public,
            created_at: Utc::now(),
        };
        self.models.insert_model(&entry).await?;
        self.metrics
            .inc_counter(metric_names::MODELS_REGISTERED)
            .await;

        info!(
            model_id = %entry.id,
            fingerprint = %entry.fingerprint,
            size_bytes = entry.size_bytes,
            "model registered"
        );
        Ok(entry)
    }

    /// A model the viewer may see
    pub async fn get(&self, id: &ModelId, viewer: &UserId) -> Result<ModelEntry> {
        let model = self
            .models
            .get_model(id)
            .await?
            .ok_or(ProverError::ModelNotFound(id.0))?;
        if !model.is_visible_to(viewer) {
            return Err(ProverError::AccessDenied("model is private".into()));
        }
        Ok(model)
    }

    /// Public models plus the viewer's own, newest first
    pub async fn list(
        &self,
        viewer: &UserId,
        filter: &ModelFilter,
        page: Page,
    ) -> Result<Paged<ModelEntry>> {
        self.models.list_models(viewer, filter, page).await
    }

    /// Only the owner may change visibility
    #[instrument(skip(self), fields(model_id = %id))]
    pub async fn set_visibility(
        &self,
        id: &ModelId,
        owner: &UserId,
        is_public: bool,
    ) -> Result<ModelEntry> {
        let mut model = self
            .models
            .get_model(id)
            .await?
            .ok_or(ProverError::ModelNotFound(id.0))?;
        if !model.is_owned_by(owner) {
            return Err(ProverError::AccessDenied(
                "only the owner may change model visibility".into(),
            ));
        }

        self.models.set_visibility(id, is_public).await?;
        model.is_public = is_public;
        info!(is_public, "model visibility changed");
        Ok(model)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }
}

fn check_extension(path: &Path, format: ModelFormat) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if format.extensions().contains(&ext.as_str()) {
        Ok(())
    } else {
        Err(ProverError::Validation(format!(
            "a {format} model must have one of the extensions {:?}",
            format.extensions()
        )))
    }
}
