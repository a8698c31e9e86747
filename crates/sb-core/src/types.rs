use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project id used when a request carries no project context.
pub const DEFAULT_PROJECT: &str = "default";

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Coarse request category. Biases model scoring only; never gates capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Coding,
    Reasoning,
    Creative,
    General,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Coding,
        TaskType::Reasoning,
        TaskType::Creative,
        TaskType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Coding => "coding",
            TaskType::Reasoning => "reasoning",
            TaskType::Creative => "creative",
            TaskType::General => "general",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coding" => Ok(TaskType::Coding),
            "reasoning" => Ok(TaskType::Reasoning),
            "creative" => Ok(TaskType::Creative),
            "general" => Ok(TaskType::General),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenAi,
    Anthropic,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Ollama, Provider::OpenAi, Provider::Anthropic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Local runtimes never bill per token.
    pub fn is_local(&self) -> bool {
        matches!(self, Provider::Ollama)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ModelDescriptor
// ---------------------------------------------------------------------------

/// Links a virtual catalog entry back to the fine-tuned artifact it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterBinding {
    pub adapter_name: String,
    pub base_model: String,
    pub artifact_path: PathBuf,
}

/// One routable model. `model_id` doubles as the catalog key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub provider: Provider,
    pub model_id: String,
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
    /// 1 is fastest.
    #[serde(default = "default_rank")]
    pub speed_rank: u8,
    /// 1 is best.
    #[serde(default = "default_rank")]
    pub quality_rank: u8,
    #[serde(default)]
    pub specialties: BTreeSet<TaskType>,
    #[serde(default = "default_max_context")]
    pub max_context: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterBinding>,
}

fn default_rank() -> u8 {
    5
}
fn default_max_context() -> u32 {
    8192
}

impl ModelDescriptor {
    pub fn new(provider: Provider, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            speed_rank: default_rank(),
            quality_rank: default_rank(),
            specialties: BTreeSet::new(),
            max_context: default_max_context(),
            adapter: None,
        }
    }

    pub fn with_pricing(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.cost_per_1k_input = per_1k_input;
        self.cost_per_1k_output = per_1k_output;
        self
    }

    pub fn with_specialties(mut self, specialties: impl IntoIterator<Item = TaskType>) -> Self {
        self.specialties = specialties.into_iter().collect();
        self
    }

    pub fn with_ranks(mut self, speed_rank: u8, quality_rank: u8) -> Self {
        self.speed_rank = speed_rank;
        self.quality_rank = quality_rank;
        self
    }

    pub fn with_max_context(mut self, max_context: u32) -> Self {
        self.max_context = max_context;
        self
    }

    pub fn key(&self) -> &str {
        &self.model_id
    }

    pub fn is_free(&self) -> bool {
        self.cost_per_1k_input <= 0.0 && self.cost_per_1k_output <= 0.0
    }

    /// Combined input + output price per 1k tokens, used for cost scoring.
    pub fn blended_price(&self) -> f64 {
        self.cost_per_1k_input + self.cost_per_1k_output
    }

    /// The model the backend actually serves; adapters run on their base.
    pub fn serving_model(&self) -> &str {
        match &self.adapter {
            Some(binding) => &binding.base_model,
            None => &self.model_id,
        }
    }

    pub fn supports(&self, task_type: TaskType) -> bool {
        self.specialties.contains(&task_type)
    }

    /// Derive the virtual descriptor for an adapter trained on `base`.
    pub fn for_adapter(
        base: &ModelDescriptor,
        adapter_name: &str,
        artifact_path: impl Into<PathBuf>,
    ) -> Self {
        let mut derived = base.clone();
        derived.model_id = adapter_key(&base.model_id, adapter_name);
        derived.adapter = Some(AdapterBinding {
            adapter_name: adapter_name.to_string(),
            base_model: base.model_id.clone(),
            artifact_path: artifact_path.into(),
        });
        derived
    }
}

/// Catalog key of an adapter: `base_model+adapter_name`.
pub fn adapter_key(base_model: &str, adapter_name: &str) -> String {
    format!("{base_model}+{adapter_name}")
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

impl RequestContext {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn project(&self) -> &str {
        self.project_id.as_deref().unwrap_or(DEFAULT_PROJECT)
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub id: Uuid,
    pub model_key: String,
    pub task_type: TaskType,
    pub project_id: String,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub success: bool,
    pub cost: f64,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTransaction {
    pub id: Uuid,
    pub project_id: String,
    pub model_key: String,
    pub cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub task_type: TaskType,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BudgetTransaction {
    pub fn tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Derived view of a project's spend in the active billing period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub project_id: String,
    pub limit: f64,
    pub usage: f64,
    pub remaining: f64,
    pub pct_used: f64,
    pub over_budget: bool,
    pub warning_reached: bool,
    pub days_remaining: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Straight-line projection. Display only.
    pub estimated_monthly_cost: f64,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Ordered by severity: `Warning < LimitReached < OverBudget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Warning,
    LimitReached,
    OverBudget,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::LimitReached => "limit_reached",
            AlertType::OverBudget => "over_budget",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(AlertType::Warning),
            "limit_reached" => Ok(AlertType::LimitReached),
            "over_budget" => Ok(AlertType::OverBudget),
            other => Err(format!("unknown alert type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub project_id: String,
    pub alert_type: AlertType,
    pub threshold_pct: f64,
    pub usage: f64,
    pub limit: f64,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved: bool,
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub adapter_name: String,
    pub base_model: String,
    pub training_sample_count: u64,
    pub loaded_at: DateTime<Utc>,
    pub artifact_path: PathBuf,
}

impl AdapterRecord {
    pub fn model_key(&self) -> String {
        adapter_key(&self.base_model, &self.adapter_name)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model_key: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl ModelHealth {
    pub fn unknown(model_key: impl Into<String>) -> Self {
        Self {
            model_key: model_key.into(),
            status: HealthStatus::Unknown,
            last_check: None,
            last_latency_ms: None,
            consecutive_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: String,
    pub hit_count: u64,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_str() {
        for t in TaskType::ALL {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), t);
        }
        assert!("poetry".parse::<TaskType>().is_err());
    }

    #[test]
    fn provider_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
        assert!(Provider::Ollama.is_local());
        assert!(!Provider::Anthropic.is_local());
    }

    #[test]
    fn adapter_descriptor_inherits_base() {
        let base = ModelDescriptor::new(Provider::Ollama, "mistral:latest")
            .with_specialties([TaskType::Creative])
            .with_ranks(2, 4);
        let derived = ModelDescriptor::for_adapter(&base, "adapter_x", "/tmp/adapter_x");

        assert_eq!(derived.key(), "mistral:latest+adapter_x");
        assert_eq!(derived.serving_model(), "mistral:latest");
        assert!(derived.supports(TaskType::Creative));
        assert!(derived.is_free());
        assert_eq!(derived.quality_rank, 4);
    }

    #[test]
    fn alert_types_order_by_severity() {
        assert!(AlertType::Warning < AlertType::LimitReached);
        assert!(AlertType::LimitReached < AlertType::OverBudget);
        assert_eq!("over_budget".parse::<AlertType>().unwrap(), AlertType::OverBudget);
    }

    #[test]
    fn request_context_defaults_project() {
        assert_eq!(RequestContext::default().project(), DEFAULT_PROJECT);
        let ctx = RequestContext::for_project("acme").with_session("s1");
        assert_eq!(ctx.project(), "acme");
        assert_eq!(ctx.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn descriptor_toml_defaults() {
        let d: ModelDescriptor =
            serde_json::from_str(r#"{"provider":"ollama","model_id":"phi3"}"#).unwrap();
        assert_eq!(d.speed_rank, 5);
        assert_eq!(d.max_context, 8192);
        assert!(d.specialties.is_empty());
        assert!(d.adapter.is_none());
    }
}
