use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sb_core::clock::{ManualClock, SharedClock};
use sb_core::store::{AdapterStore, LedgerDb};
use sb_core::types::{ModelDescriptor, Provider, TaskType};
use sb_router::adapters::{AdapterRegistry, DiscoveryReport};
use sb_router::catalog::ModelCatalog;
use sb_router::llm::BackendRegistry;

// ===========================================================================
// Helpers
// ===========================================================================

fn clock() -> SharedClock {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()))
}

fn catalog() -> ModelCatalog {
    ModelCatalog::new(
        vec![
            ModelDescriptor::new(Provider::Ollama, "mistral:latest")
                .with_specialties([TaskType::Creative]),
            ModelDescriptor::new(Provider::OpenAi, "gpt-4o-mini").with_pricing(0.15, 0.6),
        ],
        Arc::new(BackendRegistry::new()),
    )
}

fn manifest(root: &Path, folder: &str, body: &str) {
    let dir = root.join(folder);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("metadata.json"), body).unwrap();
}

fn valid(name: &str, base: &str) -> String {
    format!(r#"{{"adapter_name":"{name}","base_model":"{base}","training_samples":42}}"#)
}

// ===========================================================================
// Discovery
// ===========================================================================

#[tokio::test]
async fn adapter_inherits_base_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "adapter_x", &valid("adapter_x", "mistral:latest"));
    let catalog = catalog();
    let registry = AdapterRegistry::new(None, clock());

    let report = registry.discover(dir.path(), &catalog).await;
    assert_eq!(report.registered, vec!["mistral:latest+adapter_x".to_string()]);
    assert!(report.skipped.is_empty());

    let adapter = catalog.get("mistral:latest+adapter_x").unwrap();
    assert_eq!(adapter.provider, Provider::Ollama);
    assert_eq!(adapter.serving_model(), "mistral:latest");
    assert!(adapter.supports(TaskType::Creative));
    assert!(adapter.is_free());
    assert_eq!(
        adapter.adapter.as_ref().unwrap().artifact_path,
        dir.path().join("adapter_x")
    );
    assert_eq!(catalog.len(), 3);
}

#[tokio::test]
async fn paid_base_keeps_its_price() {
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "tuned", &valid("tuned", "gpt-4o-mini"));
    let catalog = catalog();
    AdapterRegistry::new(None, clock())
        .discover(dir.path(), &catalog)
        .await;

    let adapter = catalog.get("gpt-4o-mini+tuned").unwrap();
    assert_eq!(adapter.provider, Provider::OpenAi);
    assert!(!adapter.is_free());
}

#[tokio::test]
async fn rediscovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "adapter_x", &valid("adapter_x", "mistral:latest"));
    let catalog = catalog();
    let registry = AdapterRegistry::new(None, clock());

    registry.discover(dir.path(), &catalog).await;
    let again = registry.discover(dir.path(), &catalog).await;

    assert!(again.registered.is_empty());
    assert_eq!(again.already_known, 1);
    assert_eq!(catalog.len(), 3);
    assert_eq!(registry.loaded().len(), 1);
}

#[tokio::test]
async fn corrupt_manifests_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "a_broken", "{ not json");
    manifest(dir.path(), "b_empty", r#"{"adapter_name":"","base_model":"mistral:latest"}"#);
    manifest(dir.path(), "c_plus", &valid("bad+name", "mistral:latest"));
    manifest(dir.path(), "d_good", &valid("good", "mistral:latest"));
    // folders without a manifest are ignored
    fs::create_dir_all(dir.path().join("scratch")).unwrap();

    let catalog = catalog();
    let report = AdapterRegistry::new(None, clock())
        .discover(dir.path(), &catalog)
        .await;

    assert_eq!(report.registered, vec!["mistral:latest+good".to_string()]);
    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped[0].0.ends_with("a_broken"));
}

#[tokio::test]
async fn missing_directory_is_not_an_error() {
    let catalog = catalog();
    let report = AdapterRegistry::new(None, clock())
        .discover(Path::new("/nonexistent/switchboard/adapters"), &catalog)
        .await;
    assert_eq!(report, DiscoveryReport::default());
    assert_eq!(catalog.len(), 2);
}

#[tokio::test]
async fn unknown_base_is_assumed_local() {
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "phi", &valid("phi_tuned", "phi3:mini"));
    let catalog = catalog();
    AdapterRegistry::new(None, clock())
        .discover(dir.path(), &catalog)
        .await;

    let adapter = catalog.get("phi3:mini+phi_tuned").unwrap();
    assert_eq!(adapter.provider, Provider::Ollama);
    assert!(adapter.is_free());
}

// ===========================================================================
// Persistence
// ===========================================================================

#[tokio::test]
async fn registered_adapters_are_persisted_and_restored() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    manifest(dir.path(), "adapter_x", &valid("adapter_x", "mistral:latest"));

    let first = AdapterRegistry::new(Some(Arc::new(db.clone())), clock());
    first.discover(dir.path(), &catalog()).await;
    let stored = db.list_adapters().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].training_sample_count, 42);

    let fresh = catalog();
    let second = AdapterRegistry::new(Some(Arc::new(db)), clock());
    assert_eq!(second.restore(&fresh).await, 1);
    assert!(fresh.contains("mistral:latest+adapter_x"));
    // restoring twice adds nothing
    assert_eq!(second.restore(&fresh).await, 0);
    assert_eq!(second.loaded().len(), 1);
}
