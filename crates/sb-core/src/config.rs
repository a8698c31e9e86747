use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ModelDescriptor, Provider, TaskType};

/// Top-level configuration loaded from `~/.switchboard/config.toml`.
///
/// API keys never live here. Provider sections name the environment variable
/// that holds the key and the backend reads it at boot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    /// Catalog entries. Empty means the built-in catalog.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl Config {
    /// Load config from `~/.switchboard/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The catalog to boot with, in scan order.
    pub fn catalog(&self) -> Vec<ModelDescriptor> {
        if self.models.is_empty() {
            default_models()
        } else {
            self.models.clone()
        }
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.router.validate()?;
        self.budget.validate()?;
        self.writer.validate()?;

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.model_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate model key '{}'",
                    model.model_id
                )));
            }
            if model.cost_per_1k_input < 0.0 || model.cost_per_1k_output < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "model '{}' has a negative price",
                    model.model_id
                )));
            }
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        home_dir().join(".switchboard").join("config.toml")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_service_name() -> String {
    "switchboard".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// When false the router runs with no ledger: budgets fail open and
    /// performance scores stay at the cold-start prior.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_storage_path(),
            in_memory: false,
        }
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_storage_path() -> String {
    "~/.switchboard/ledger.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_fast_tier_entries")]
    pub fast_tier_max_entries: usize,
    /// Back the fast tier with the SQLite `response_cache` table.
    #[serde(default = "default_true")]
    pub durable: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_cache_ttl(),
            fast_tier_max_entries: default_fast_tier_entries(),
            durable: true,
        }
    }
}

fn default_cache_ttl() -> u64 {
    86_400
}
fn default_fast_tier_entries() -> usize {
    1000
}

/// Which implementation answers for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Http,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: BackendKind,
    /// Overrides the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Used when the live model listing fails.
    #[serde(default)]
    pub static_models: Vec<String>,
}

impl ProviderEndpoint {
    fn with_key_env(env: &str, static_models: &[&str]) -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Http,
            base_url: None,
            api_key_env: Some(env.to_string()),
            static_models: static_models.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Http,
            base_url: None,
            api_key_env: None,
            static_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: ProviderEndpoint,
    #[serde(default = "default_openai_endpoint")]
    pub openai: ProviderEndpoint,
    #[serde(default = "default_anthropic_endpoint")]
    pub anthropic: ProviderEndpoint,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama: ProviderEndpoint::default(),
            openai: default_openai_endpoint(),
            anthropic: default_anthropic_endpoint(),
        }
    }
}

impl ProvidersConfig {
    pub fn endpoint(&self, provider: Provider) -> &ProviderEndpoint {
        match provider {
            Provider::Ollama => &self.ollama,
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
        }
    }
}

fn default_openai_endpoint() -> ProviderEndpoint {
    ProviderEndpoint::with_key_env("OPENAI_API_KEY", &["gpt-4o-mini", "gpt-4o"])
}
fn default_anthropic_endpoint() -> ProviderEndpoint {
    ProviderEndpoint::with_key_env(
        "ANTHROPIC_API_KEY",
        &["claude-3-5-haiku-latest", "claude-3-5-sonnet-latest"],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_w_performance")]
    pub performance: f64,
    #[serde(default = "default_w_specialization")]
    pub specialization: f64,
    #[serde(default = "default_w_availability")]
    pub availability: f64,
    #[serde(default = "default_w_cost")]
    pub cost: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            performance: default_w_performance(),
            specialization: default_w_specialization(),
            availability: default_w_availability(),
            cost: default_w_cost(),
        }
    }
}

fn default_w_performance() -> f64 {
    0.4
}
fn default_w_specialization() -> f64 {
    0.3
}
fn default_w_availability() -> f64 {
    0.2
}
fn default_w_cost() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Substituted whenever no catalog entry is eligible.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_provider")]
    pub default_provider: Provider,
    #[serde(default)]
    pub weights: ScoringWeights,
    /// Ordered alternatives for resilience. Recorded as policy; dispatch does
    /// not walk it.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_performance_window")]
    pub performance_window: usize,
    /// Output size assumed when estimating cost before dispatch.
    #[serde(default = "default_estimated_output_tokens")]
    pub estimated_output_tokens: u64,
    /// How often the daemon re-polls provider model listings. 0 disables.
    #[serde(default = "default_availability_refresh")]
    pub availability_refresh_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_provider: default_provider(),
            weights: ScoringWeights::default(),
            fallback_chain: Vec::new(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            performance_window: default_performance_window(),
            estimated_output_tokens: default_estimated_output_tokens(),
            availability_refresh_secs: default_availability_refresh(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "router.default_model must not be empty".into(),
            ));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "router.dispatch_timeout_secs must be > 0".into(),
            ));
        }
        if self.performance_window == 0 {
            return Err(ConfigError::Validation(
                "router.performance_window must be > 0".into(),
            ));
        }
        let w = &self.weights;
        let all = [w.performance, w.specialization, w.availability, w.cost];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::Validation(
                "router.weights must be finite and non-negative".into(),
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Validation(
                "router.weights must not all be zero".into(),
            ));
        }
        if self.fallback_chain.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "router.fallback_chain contains an empty model key".into(),
            ));
        }
        Ok(())
    }

    /// The fallback model. Taken from `catalog` when listed there so it
    /// carries the catalog's prices; otherwise a bare, unpriced descriptor.
    pub fn default_descriptor(&self, catalog: &[ModelDescriptor]) -> ModelDescriptor {
        catalog
            .iter()
            .find(|d| d.key() == self.default_model)
            .cloned()
            .unwrap_or_else(|| {
                ModelDescriptor::new(self.default_provider, self.default_model.clone())
                    .with_specialties([TaskType::General])
            })
    }
}

fn default_model() -> String {
    "llama3.2:latest".into()
}
fn default_provider() -> Provider {
    Provider::Ollama
}
fn default_dispatch_timeout() -> u64 {
    30
}
fn default_performance_window() -> usize {
    100
}
fn default_estimated_output_tokens() -> u64 {
    500
}
fn default_availability_refresh() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When false, admission control always allows paid models.
    #[serde(default = "default_true")]
    pub auto_fallback: bool,
    #[serde(default = "default_monthly_limit")]
    pub default_monthly_limit: f64,
    #[serde(default = "default_warning_pct")]
    pub warning_threshold_pct: f64,
    /// Day of month the billing period starts on.
    #[serde(default = "default_reset_day")]
    pub reset_day: u32,
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
    /// Per-project limits applied at boot.
    #[serde(default)]
    pub projects: BTreeMap<String, f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_fallback: true,
            default_monthly_limit: default_monthly_limit(),
            warning_threshold_pct: default_warning_pct(),
            reset_day: default_reset_day(),
            status_ttl_secs: default_status_ttl(),
            projects: BTreeMap::new(),
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=28).contains(&self.reset_day) {
            return Err(ConfigError::Validation(format!(
                "budget.reset_day must be within 1..=28, got {}",
                self.reset_day
            )));
        }
        if !(self.warning_threshold_pct > 0.0 && self.warning_threshold_pct < 100.0) {
            return Err(ConfigError::Validation(format!(
                "budget.warning_threshold_pct must be within (0, 100), got {}",
                self.warning_threshold_pct
            )));
        }
        if self.default_monthly_limit < 0.0 {
            return Err(ConfigError::Validation(
                "budget.default_monthly_limit must not be negative".into(),
            ));
        }
        if let Some((project, _)) = self.projects.iter().find(|(_, limit)| **limit < 0.0) {
            return Err(ConfigError::Validation(format!(
                "budget.projects.{project} must not be negative"
            )));
        }
        Ok(())
    }
}

fn default_monthly_limit() -> f64 {
    100.0
}
fn default_warning_pct() -> f64 {
    80.0
}
fn default_reset_day() -> u32 {
    1
}
fn default_status_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Root of the adapter tree. Discovery is skipped when unset.
    #[serde(default)]
    pub dir: Option<String>,
}

impl AdaptersConfig {
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir.as_deref().map(expand_home)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "writer.queue_capacity must be > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "writer.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

/// Catalog used when `[[models]]` is empty. Prices are USD per 1k tokens.
pub fn default_models() -> Vec<ModelDescriptor> {
    use TaskType::*;
    vec![
        ModelDescriptor::new(Provider::Ollama, "llama3.2:latest")
            .with_ranks(2, 5)
            .with_specialties([General])
            .with_max_context(131_072),
        ModelDescriptor::new(Provider::Ollama, "mistral:latest")
            .with_ranks(2, 5)
            .with_specialties([General, Creative])
            .with_max_context(32_768),
        ModelDescriptor::new(Provider::Ollama, "qwen2.5-coder:latest")
            .with_ranks(3, 4)
            .with_specialties([Coding])
            .with_max_context(32_768),
        ModelDescriptor::new(Provider::OpenAi, "gpt-4o-mini")
            .with_pricing(0.000_15, 0.000_6)
            .with_ranks(1, 3)
            .with_specialties([General, Coding])
            .with_max_context(128_000),
        ModelDescriptor::new(Provider::OpenAi, "gpt-4o")
            .with_pricing(0.002_5, 0.01)
            .with_ranks(2, 1)
            .with_specialties([Coding, Reasoning, Creative])
            .with_max_context(128_000),
        ModelDescriptor::new(Provider::Anthropic, "claude-3-5-haiku-latest")
            .with_pricing(0.000_8, 0.004)
            .with_ranks(1, 3)
            .with_specialties([General])
            .with_max_context(200_000),
        ModelDescriptor::new(Provider::Anthropic, "claude-3-5-sonnet-latest")
            .with_pricing(0.003, 0.015)
            .with_ranks(2, 1)
            .with_specialties([Coding, Reasoning, Creative])
            .with_max_context(200_000),
    ]
}
