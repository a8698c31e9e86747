//! Fine-tuned adapter discovery.
//!
//! Training runs out of process and leaves one folder per adapter, each with
//! a `metadata.json` manifest. Discovery turns every new manifest into an
//! [`AdapterRecord`] plus a virtual catalog entry keyed `base+adapter`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use sb_core::clock::SharedClock;
use sb_core::store::AdapterStore;
use sb_core::types::{AdapterRecord, ModelDescriptor, Provider};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;

pub const MANIFEST_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdapterManifest {
    pub adapter_name: String,
    pub base_model: String,
    #[serde(default)]
    pub training_samples: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiscoveryReport {
    /// Catalog keys added by this pass.
    pub registered: Vec<String>,
    pub already_known: usize,
    /// Manifests that could not be used, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

fn read_manifest(path: &Path) -> Result<AdapterManifest, AdapterError> {
    let text = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: AdapterManifest =
        serde_json::from_str(&text).map_err(|source| AdapterError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;
    if manifest.adapter_name.trim().is_empty() || manifest.base_model.trim().is_empty() {
        return Err(AdapterError::Invalid {
            path: path.to_path_buf(),
            reason: "adapter_name and base_model must be non-empty".into(),
        });
    }
    if manifest.adapter_name.contains('+') {
        return Err(AdapterError::Invalid {
            path: path.to_path_buf(),
            reason: "adapter_name must not contain '+'".into(),
        });
    }
    Ok(manifest)
}

/// Walk `root` depth-first. A folder holding a manifest is an adapter and is
/// not descended into. Results come back sorted by folder path.
fn scan(root: &Path) -> Vec<(PathBuf, Result<AdapterManifest, AdapterError>)> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let manifest = dir.join(MANIFEST_FILE);
        if dir != root && manifest.is_file() {
            found.push((dir, read_manifest(&manifest)));
            continue;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read adapter directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

pub struct AdapterRegistry {
    records: RwLock<Vec<AdapterRecord>>,
    store: Option<Arc<dyn AdapterStore>>,
    clock: SharedClock,
}

impl AdapterRegistry {
    pub fn new(store: Option<Arc<dyn AdapterStore>>, clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            store,
            clock,
        }
    }

    /// Registered adapters in registration order.
    pub fn loaded(&self) -> Vec<AdapterRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-register adapters persisted by earlier runs. Returns how many were
    /// added to the catalog.
    pub async fn restore(&self, catalog: &ModelCatalog) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let persisted = match store.list_adapters().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not load persisted adapters");
                return 0;
            }
        };
        let mut restored = 0;
        for record in persisted {
            if self.register(record, catalog) {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "persisted adapters restored");
        }
        restored
    }

    /// Scan `root` and register every adapter not already in the catalog.
    /// Missing or corrupt manifests are logged and skipped.
    pub async fn discover(&self, root: &Path, catalog: &ModelCatalog) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if !root.is_dir() {
            warn!(dir = %root.display(), "adapter directory missing, skipping discovery");
            return report;
        }

        let owned = root.to_path_buf();
        let scanned = match tokio::task::spawn_blocking(move || scan(&owned)).await {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!(error = %e, "adapter scan aborted");
                return report;
            }
        };

        for (folder, manifest) in scanned {
            let manifest = match manifest {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "skipping adapter");
                    report.skipped.push((folder, e.to_string()));
                    continue;
                }
            };

            let record = AdapterRecord {
                adapter_name: manifest.adapter_name,
                base_model: manifest.base_model,
                training_sample_count: manifest.training_samples,
                loaded_at: self.clock.now(),
                artifact_path: folder,
            };
            let key = record.model_key();
            if catalog.contains(&key) {
                report.already_known += 1;
                continue;
            }
            if self.register(record.clone(), catalog) {
                self.persist(&record).await;
                report.registered.push(key);
            }
        }

        info!(
            registered = report.registered.len(),
            already_known = report.already_known,
            skipped = report.skipped.len(),
            "adapter discovery finished"
        );
        report
    }

    fn register(&self, record: AdapterRecord, catalog: &ModelCatalog) -> bool {
        let base = catalog.get(&record.base_model).unwrap_or_else(|| {
            debug!(
                base = %record.base_model,
                "adapter base not in catalog, assuming a local model"
            );
            ModelDescriptor::new(Provider::Ollama, record.base_model.clone())
        });
        let descriptor =
            ModelDescriptor::for_adapter(&base, &record.adapter_name, record.artifact_path.clone());
        if !catalog.register(descriptor) {
            return false;
        }
        info!(
            adapter = %record.adapter_name,
            base = %record.base_model,
            samples = record.training_sample_count,
            "adapter registered"
        );
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        true
    }

    async fn persist(&self, record: &AdapterRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_adapter(record).await {
                warn!(adapter = %record.adapter_name, error = %e, "adapter not persisted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_stops_at_adapter_folders() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("team/adapter_a");
        let nested = a.join("checkpoints/adapter_inner");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            a.join(MANIFEST_FILE),
            r#"{"adapter_name":"adapter_a","base_model":"phi3"}"#,
        )
        .unwrap();
        fs::write(
            nested.join(MANIFEST_FILE),
            r#"{"adapter_name":"inner","base_model":"phi3"}"#,
        )
        .unwrap();

        let found = scan(dir.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, a);
        assert_eq!(found[0].1.as_ref().unwrap().training_samples, 0);
    }

    #[test]
    fn manifest_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_manifest(&path), Err(AdapterError::Manifest { .. })));

        fs::write(&path, r#"{"adapter_name":"","base_model":"phi3"}"#).unwrap();
        assert!(matches!(read_manifest(&path), Err(AdapterError::Invalid { .. })));

        fs::write(&path, r#"{"adapter_name":"a+b","base_model":"phi3"}"#).unwrap();
        assert!(matches!(read_manifest(&path), Err(AdapterError::Invalid { .. })));

        assert!(matches!(
            read_manifest(&dir.path().join("missing.json")),
            Err(AdapterError::Io { .. })
        ));
    }
}
