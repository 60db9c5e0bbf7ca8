//! Where models come from: a directory of artifacts in production, a map in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mandi_core::ModelKey;
use mandi_storage::{ArtifactError, ModelArtifactStore};
use thiserror::Error;
use tracing::debug;

use crate::model::{ForecastModel, LinearArtifact, ModelError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model storage unavailable: {0}")]
    Unavailable(#[from] ArtifactError),
    #[error("model artifact {key} is unusable: {source}")]
    Corrupt {
        key: ModelKey,
        #[source]
        source: ModelError,
    },
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// `Ok(None)` means no model exists for the key, which callers report as an
/// unsupported combination rather than a failure.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn load(&self, key: &ModelKey) -> Result<Option<Arc<dyn ForecastModel>>, RegistryError>;
}

/// Loads [`LinearArtifact`] JSON files from a [`ModelArtifactStore`].
#[derive(Debug, Clone)]
pub struct FsModelRegistry {
    artifacts: ModelArtifactStore,
}

impl FsModelRegistry {
    pub fn new(artifacts: ModelArtifactStore) -> Self {
        Self { artifacts }
    }

    pub fn artifacts(&self) -> &ModelArtifactStore {
        &self.artifacts
    }
}

#[async_trait]
impl ModelRegistry for FsModelRegistry {
    async fn load(&self, key: &ModelKey) -> Result<Option<Arc<dyn ForecastModel>>, RegistryError> {
        let Some(bytes) = self.artifacts.read(key).await? else {
            debug!(model_key = %key, "no artifact on disk");
            return Ok(None);
        };
        let artifact = LinearArtifact::from_json(&bytes).map_err(|source| RegistryError::Corrupt {
            key: key.clone(),
            source,
        })?;
        let model: Arc<dyn ForecastModel> = Arc::new(artifact);
        Ok(Some(model))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryModelRegistry {
    models: HashMap<ModelKey, Arc<dyn ForecastModel>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, key: ModelKey, model: Arc<dyn ForecastModel>) -> Self {
        self.models.insert(key, model);
        self
    }

    pub fn insert(&mut self, key: ModelKey, model: Arc<dyn ForecastModel>) {
        self.models.insert(key, model);
    }
}

#[async_trait]
impl ModelRegistry for InMemoryModelRegistry {
    async fn load(&self, key: &ModelKey) -> Result<Option<Arc<dyn ForecastModel>>, RegistryError> {
        Ok(self.models.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureRow;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    const ARTIFACT: &[u8] = br#"{"intercept":0.0,"min_price_coef":0.0,"max_price_coef":0.0,
        "yesterday_price_coef":1.0,"residual_sigma":0.1}"#;

    #[tokio::test]
    async fn fs_registry_loads_installed_artifacts() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ModelArtifactStore::new(dir.path());
        let key = ModelKey::new("Nashik", "Onion", "Red");
        artifacts.install(&key, ARTIFACT).await.expect("install");

        let registry = FsModelRegistry::new(artifacts);
        let model = registry.load(&key).await.expect("load").expect("model");
        let row = FeatureRow {
            ds: NaiveDate::from_ymd_opt(2026, 10, 15).unwrap(),
            min_price: 7.0,
            max_price: 7.6,
            yesterday_price: 7.4,
        };
        let out = model.predict(&[row]).expect("predict");
        assert!((out[0].mean - 7.4).abs() < 1e-12);

        let missing = registry
            .load(&ModelKey::new("Pune", "Onion", "Red"))
            .await
            .expect("load");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn corrupt_artifact_is_not_retryable() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ModelArtifactStore::new(dir.path());
        let key = ModelKey::new("Nashik", "Onion", "Red");
        artifacts.install(&key, b"{\"intercept\":").await.expect("install");

        let err = match FsModelRegistry::new(artifacts).load(&key).await {
            Err(err) => err,
            Ok(_) => panic!("corrupt artifact loaded"),
        };
        assert!(matches!(err, RegistryError::Corrupt { .. }));
        assert!(!err.is_retryable());
    }
}
