use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use sb_core::config::Config;
use sb_core::types::{ModelDescriptor, Provider};
use tracing::{debug, info, warn};

use crate::llm::BackendRegistry;

/// Ollama reports `name:tag`; configs often omit the default tag.
fn normalize(model_id: &str) -> &str {
    model_id.strip_suffix(":latest").unwrap_or(model_id)
}

/// Static descriptors loaded at boot plus adapter-derived entries appended
/// at runtime, together with the last known per-provider model listing.
pub struct ModelCatalog {
    entries: RwLock<Vec<ModelDescriptor>>,
    listed: RwLock<HashMap<Provider, HashSet<String>>>,
    static_models: HashMap<Provider, Vec<String>>,
    backends: Arc<BackendRegistry>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelDescriptor>, backends: Arc<BackendRegistry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            listed: RwLock::new(HashMap::new()),
            static_models: HashMap::new(),
            backends,
        }
    }

    pub fn from_config(config: &Config, backends: Arc<BackendRegistry>) -> Self {
        let mut catalog = Self::new(config.catalog(), backends);
        for provider in Provider::ALL {
            let models = &config.providers.endpoint(provider).static_models;
            if !models.is_empty() {
                catalog = catalog.with_static_models(provider, models.clone());
            }
        }
        catalog
    }

    pub fn with_static_models(mut self, provider: Provider, models: Vec<String>) -> Self {
        self.static_models.insert(provider, models);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot in scan order. Scan order breaks selector ties.
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<ModelDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.key() == key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Append unless the key is already present. Returns whether it was added.
    pub fn register(&self, descriptor: ModelDescriptor) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|d| d.key() == descriptor.key()) {
            return false;
        }
        debug!(model = descriptor.key(), "catalog entry registered");
        entries.push(descriptor);
        true
    }

    /// Models the provider serves right now. A failed live listing falls back
    /// to the configured static list; a provider with no backend lists nothing.
    pub async fn list_available(&self, provider: Provider) -> Vec<String> {
        let models = match self.backends.get(provider) {
            None => Vec::new(),
            Some(backend) => match backend.list_models().await {
                Ok(models) => models,
                Err(e) => {
                    let fallback = self.static_models.get(&provider).cloned().unwrap_or_default();
                    warn!(
                        %provider,
                        error = %e,
                        fallback = fallback.len(),
                        "live model listing failed, using static list"
                    );
                    fallback
                }
            },
        };

        let normalized = models.iter().map(|m| normalize(m).to_string()).collect();
        self.listed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(provider, normalized);
        models
    }

    pub async fn refresh_availability(&self) {
        for provider in Provider::ALL {
            let models = self.list_available(provider).await;
            info!(%provider, models = models.len(), "provider availability refreshed");
        }
    }

    /// Whether the descriptor's provider last listed the model it is served
    /// by (the base model, for adapters).
    pub fn is_listed(&self, descriptor: &ModelDescriptor) -> bool {
        self.listed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.provider)
            .is_some_and(|models| models.contains(normalize(descriptor.serving_model())))
    }
}
