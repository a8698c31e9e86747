use sb_core::config::{BackendKind, Config};
use sb_core::types::{Provider, TaskType};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.service_name, "switchboard");
    assert_eq!(cfg.general.log_level, "info");
    assert!(cfg.storage.enabled);
    assert!(cfg.cache.enabled);
    assert_eq!(cfg.cache.fast_tier_max_entries, 1000);
    assert_eq!(cfg.router.default_model, "llama3.2:latest");
    assert_eq!(cfg.router.default_provider, Provider::Ollama);
    assert_eq!(cfg.budget.warning_threshold_pct, 80.0);
    assert_eq!(cfg.budget.status_ttl_secs, 300);
    assert_eq!(cfg.writer.queue_capacity, 1024);
    assert_eq!(
        cfg.providers.openai.api_key_env.as_deref(),
        Some("OPENAI_API_KEY")
    );
    assert!(cfg.adapters.dir.is_none());
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("switchboard"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.router.default_model, cfg.router.default_model);
    assert_eq!(parsed.budget.reset_day, cfg.budget.reset_day);
    assert_eq!(parsed.router.weights, cfg.router.weights);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[budget]
reset_day = 15
default_monthly_limit = 25.0

[budget.projects]
acme = 10.0

[providers.ollama]
backend = "mock"
static_models = ["llama3.2:latest"]

[[models]]
provider = "ollama"
model_id = "llama3.2:latest"
specialties = ["general", "coding"]
"#;
    let cfg = Config::from_toml_str(partial).expect("parse partial");
    assert_eq!(cfg.budget.reset_day, 15);
    assert_eq!(cfg.budget.projects.get("acme"), Some(&10.0));
    assert_eq!(cfg.providers.ollama.backend, BackendKind::Mock);
    // defaults should fill in the rest
    assert_eq!(cfg.router.dispatch_timeout_secs, 30);
    assert!(cfg.providers.anthropic.enabled);

    let catalog = cfg.catalog();
    assert_eq!(catalog.len(), 1);
    assert!(catalog[0].supports(TaskType::Coding));
    assert!(catalog[0].is_free());
}

#[test]
fn reset_day_outside_range_fails_validation() {
    let mut cfg = Config::default();
    cfg.budget.reset_day = 31;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("reset_day"));

    cfg.budget.reset_day = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn zero_weights_fail_validation() {
    let mut cfg = Config::default();
    cfg.router.weights.performance = 0.0;
    cfg.router.weights.specialization = 0.0;
    cfg.router.weights.availability = 0.0;
    cfg.router.weights.cost = 0.0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("weights"));
}

#[test]
fn duplicate_models_fail_validation() {
    let text = r#"
[[models]]
provider = "ollama"
model_id = "phi3"

[[models]]
provider = "openai"
model_id = "phi3"
"#;
    let err = Config::from_toml_str(text).expect_err("duplicate keys rejected");
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn load_from_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[router]\ndispatch_timeout_secs = 5\n").unwrap();

    let cfg = Config::load_from(&path).unwrap();
    assert_eq!(cfg.router.dispatch_timeout_secs, 5);

    let missing = Config::load_from(dir.path().join("nope.toml"));
    assert!(matches!(missing, Err(sb_core::config::ConfigError::Io(_))));
}

#[test]
fn default_descriptor_takes_catalog_prices() {
    let mut cfg = Config::default();
    cfg.router.default_model = "gpt-4o".into();
    cfg.router.default_provider = Provider::OpenAi;

    let priced = cfg.router.default_descriptor(&cfg.catalog());
    assert_eq!(priced.provider, Provider::OpenAi);
    assert!(!priced.is_free());
    assert!(priced.supports(TaskType::Reasoning));

    // not in the catalog: bare and unpriced
    let bare = cfg.router.default_descriptor(&[]);
    assert_eq!(bare.key(), "gpt-4o");
    assert!(bare.is_free());
    assert!(bare.supports(TaskType::General));
}
