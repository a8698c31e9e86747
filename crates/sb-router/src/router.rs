//! The request-routing facade.
//!
//! ```text
//! generate(prompt, model?, ctx)
//!   ├─ explicit model? ── yes ──────────────┐
//!   └─ classify ─> select                   │
//!                    └──────────────────────┴─> cache probe ── hit ──> return (no cost, no records)
//!                                                   │ miss
//!                                                   ├─ paid? ─> admission ── denied ──> re-select free, re-probe
//!                                                   │                                     └─ still paid ─> budget_exhausted
//!                                                   └─ dispatch ─┬─ ok ──> enqueue usage + performance + cache
//!                                                                └─ err ─> enqueue failed performance, return failure
//! ```
//!
//! Everything the router depends on is constructed once and injected through
//! [`RouterBuilder`]; there is no process-global state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sb_core::clock::{SharedClock, SystemClock};
use sb_core::config::{Config, RouterConfig, StorageConfig};
use sb_core::store::{AdapterStore, LedgerDb, PerformanceStore, ResponseStore, SpendStore};
use sb_core::types::{
    AdapterRecord, BudgetStatus, ModelDescriptor, ModelHealth, PerformanceRecord, RequestContext,
    TaskType,
};
use sb_harness::health::{HealthConfig, HealthTracker};
use sb_harness::shutdown::{DrainResult, ShutdownSignal};
use sb_telemetry::metrics::{
    MetricsCollector, BUDGET_DENIALS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CATALOG_MODELS,
    REQUESTS_TOTAL,
};
use sb_telemetry::spans::request_span;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn, Instrument, Span};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, DiscoveryReport};
use crate::budget::{BudgetLedger, Usage};
use crate::catalog::ModelCatalog;
use crate::classifier::{Classifier, KeywordClassifier};
use crate::dispatcher::Dispatcher;
use crate::llm::BackendRegistry;
use crate::performance::PerformanceLedger;
use crate::pricing::PriceTable;
use crate::response_cache::{CacheStats, ResponseCache};
use crate::selector::{CandidateFilter, ModelSelector, Selection, SelectionSource};
use crate::writer::{BackgroundWriter, WriteError, WriteJob, WriteSinks};

/// [`GenerateFailure::kind`] when admission refuses a paid model and only
/// paid models remain.
pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";

/// Rough tokens-per-word ratio. Not a tokenizer.
const TOKENS_PER_WORD: f64 = 1.3;

pub fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * TOKENS_PER_WORD) as u64
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Generated {
    pub response: String,
    pub model_config: ModelDescriptor,
    pub task_type: TaskType,
    pub duration: Duration,
    pub cached: bool,
    /// The preferred paid model was refused by admission control and a free
    /// model answered instead.
    pub budget_fallback: bool,
    pub trace_id: String,
    /// Absent for cache hits.
    pub metrics: Option<RequestMetrics>,
}

/// A dispatch failure as seen by the caller.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{error}")]
pub struct GenerateFailure {
    pub error: String,
    pub kind: &'static str,
    pub model_config: ModelDescriptor,
    pub duration: Duration,
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RouterBuilder {
    config: Config,
    clock: SharedClock,
    backends: Option<BackendRegistry>,
    ledger: Option<LedgerDb>,
    classifier: Arc<dyn Classifier>,
    metrics: Arc<MetricsCollector>,
    health: HealthConfig,
    shutdown: ShutdownSignal,
}

impl RouterBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            backends: None,
            ledger: None,
            classifier: Arc::new(KeywordClassifier::default()),
            metrics: Arc::new(MetricsCollector::new()),
            health: HealthConfig::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to the registry built from `config.providers`.
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Without a ledger, budgeting fails open and scores use the cold-start
    /// prior.
    pub fn ledger(mut self, ledger: Option<LedgerDb>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Wire everything together and start the background writer. Must run
    /// inside a tokio runtime.
    pub fn build(self) -> RequestRouter {
        let Self {
            config,
            clock,
            backends,
            ledger,
            classifier,
            metrics,
            health,
            shutdown,
        } = self;

        let backends = Arc::new(
            backends.unwrap_or_else(|| BackendRegistry::from_config(&config.providers)),
        );
        let db = ledger.map(Arc::new);
        let catalog = Arc::new(ModelCatalog::from_config(&config, backends.clone()));
        let health = Arc::new(HealthTracker::new(health));

        let performance = Arc::new(PerformanceLedger::new(
            db.clone().map(|d| d as Arc<dyn PerformanceStore>),
            config.router.performance_window,
        ));
        let budget = Arc::new(BudgetLedger::new(
            config.budget.clone(),
            db.clone().map(|d| d as Arc<dyn SpendStore>),
            PriceTable::from_catalog(&catalog.descriptors()),
            clock.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(
            &config.cache,
            db.clone().map(|d| d as Arc<dyn ResponseStore>),
            clock.clone(),
        ));
        let adapters = AdapterRegistry::new(db.map(|d| d as Arc<dyn AdapterStore>), clock.clone());

        let selector = ModelSelector::new(
            catalog.clone(),
            performance.clone(),
            health.clone(),
            config.router.weights,
            config.router.default_descriptor(&catalog.descriptors()),
            clock.clone(),
        );
        let dispatcher = Dispatcher::new(
            backends,
            health.clone(),
            Duration::from_secs(config.router.dispatch_timeout_secs),
            clock.clone(),
            metrics.clone(),
        );
        let writer = BackgroundWriter::spawn(
            &config.writer,
            WriteSinks {
                budget: budget.clone(),
                performance: performance.clone(),
                cache: cache.clone(),
            },
            shutdown,
            metrics.clone(),
        );

        RequestRouter {
            config,
            clock,
            catalog,
            adapters,
            classifier,
            selector,
            budget,
            cache,
            dispatcher,
            health,
            writer,
            metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestRouter
// ---------------------------------------------------------------------------

pub struct RequestRouter {
    config: Config,
    clock: SharedClock,
    catalog: Arc<ModelCatalog>,
    adapters: AdapterRegistry,
    classifier: Arc<dyn Classifier>,
    selector: ModelSelector,
    budget: Arc<BudgetLedger>,
    cache: Arc<ResponseCache>,
    dispatcher: Dispatcher,
    health: Arc<HealthTracker>,
    writer: BackgroundWriter,
    metrics: Arc<MetricsCollector>,
}

impl RequestRouter {
    pub fn builder(config: Config) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    /// Production wiring: open the ledger named by `config.storage`, build
    /// backends from configuration, then [`start`](Self::start).
    pub async fn boot(config: Config, shutdown: ShutdownSignal, metrics: Arc<MetricsCollector>) -> Self {
        let ledger = open_ledger(&config.storage).await;
        let router = RouterBuilder::new(config)
            .ledger(ledger)
            .metrics(metrics)
            .shutdown(shutdown)
            .build();
        router.start().await;
        router
    }

    /// Restore persisted adapters, seed configured budgets, refresh provider
    /// availability and run adapter discovery if a directory is configured.
    /// Every step is best effort.
    pub async fn start(&self) {
        self.adapters.restore(&self.catalog).await;

        for (project_id, limit) in &self.config.budget.projects {
            if let Err(e) = self.budget.set_project_budget(project_id, *limit).await {
                warn!(project_id, error = %e, "could not seed project budget");
            }
        }

        self.catalog.refresh_availability().await;

        if let Some(dir) = self.config.adapters.resolved_dir() {
            self.discover_adapters(&dir).await;
        }
        self.metrics.set_gauge(CATALOG_MODELS, self.catalog.len() as i64);
        info!(
            models = self.catalog.len(),
            adapters = self.adapters.loaded().len(),
            budgeting = self.budget.is_enabled(),
            "router ready"
        );
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    pub fn classify(&self, text: &str) -> TaskType {
        self.classifier.classify(text)
    }

    /// Classify `text` and score the catalog. Advisory: `generate` accepts
    /// any explicit model instead.
    pub async fn select_model(&self, text: &str, ctx: &RequestContext) -> Selection {
        let task_type = self.classify(text);
        let selection = self.selector.select(task_type, CandidateFilter::Any).await;
        info!(
            project_id = ctx.project(),
            task = %task_type,
            model = selection.model.key(),
            "model chosen"
        );
        selection
    }

    pub fn model(&self, key: &str) -> Option<ModelDescriptor> {
        self.catalog.get(key)
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    pub async fn generate(
        &self,
        prompt: &str,
        model: Option<ModelDescriptor>,
        ctx: &RequestContext,
    ) -> Result<Generated, GenerateFailure> {
        let (span, trace_id) = request_span(ctx.project());
        self.route(prompt, model, ctx, trace_id)
            .instrument(span)
            .await
    }

    async fn route(
        &self,
        prompt: &str,
        model: Option<ModelDescriptor>,
        ctx: &RequestContext,
        trace_id: String,
    ) -> Result<Generated, GenerateFailure> {
        let started = Instant::now();
        let project_id = ctx.project();

        let mut selection = match model {
            Some(model) => Selection {
                model,
                task_type: TaskType::General,
                scores: None,
                source: SelectionSource::Explicit,
            },
            None => self.select_model(prompt, ctx).await,
        };

        if let Some(hit) = self.probe_cache(prompt, &selection, false, started, &trace_id).await {
            return Ok(hit);
        }

        let mut budget_fallback = false;
        if self.budget.is_paid(&selection.model) {
            let estimate = self.budget.cost_for_model(
                &selection.model,
                estimate_tokens(prompt),
                self.config.router.estimated_output_tokens,
            );
            if !self.budget.should_use_paid_model(project_id, Some(estimate)).await {
                self.metrics.increment_counter(BUDGET_DENIALS_TOTAL, &[]);
                let denied = selection.model.key().to_string();
                selection = self
                    .selector
                    .select(selection.task_type, CandidateFilter::FreeOnly)
                    .await;
                budget_fallback = true;
                info!(
                    project_id,
                    denied = %denied,
                    model = selection.model.key(),
                    estimate,
                    "paid model refused by budget, using free model"
                );
                if self.budget.is_paid(&selection.model) {
                    return Err(self.refuse(project_id, selection.model, started, trace_id));
                }
                if let Some(hit) = self.probe_cache(prompt, &selection, true, started, &trace_id).await {
                    return Ok(hit);
                }
            }
        }

        let span = Span::current();
        span.record("model", selection.model.key());
        span.record("cached", false);

        match self.dispatcher.dispatch(prompt, &selection.model).await {
            Ok(dispatched) => {
                let tokens_in = estimate_tokens(prompt);
                let tokens_out = estimate_tokens(&dispatched.text);
                let cost = self.budget.cost_for_model(&selection.model, tokens_in, tokens_out);
                self.record_success(ctx, &selection, tokens_in, tokens_out, cost, dispatched.latency_ms);
                self.cache_response(prompt, &selection.model, &dispatched.text).await;

                span.record("outcome", "success");
                self.metrics
                    .increment_counter(REQUESTS_TOTAL, &[("outcome", "success")]);
                Ok(Generated {
                    response: dispatched.text,
                    model_config: selection.model,
                    task_type: selection.task_type,
                    duration: started.elapsed(),
                    cached: false,
                    budget_fallback,
                    trace_id,
                    metrics: Some(RequestMetrics {
                        tokens_in,
                        tokens_out,
                        cost,
                        latency_ms: dispatched.latency_ms,
                    }),
                })
            }
            Err(e) => {
                let duration = started.elapsed();
                let latency_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                self.writer.enqueue(WriteJob::Performance(PerformanceRecord {
                    id: Uuid::new_v4(),
                    model_key: selection.model.key().to_string(),
                    task_type: selection.task_type,
                    project_id: project_id.to_string(),
                    latency_ms,
                    tokens_in: estimate_tokens(prompt),
                    tokens_out: 0,
                    success: false,
                    cost: 0.0,
                    task_id: ctx.task_id.clone(),
                    session_id: ctx.session_id.clone(),
                    error: Some(e.to_string()),
                    created_at: self.clock.now(),
                }));

                span.record("outcome", "failure");
                self.metrics
                    .increment_counter(REQUESTS_TOTAL, &[("outcome", "failure")]);
                warn!(model = selection.model.key(), error = %e, "generation failed");
                Err(GenerateFailure {
                    error: e.to_string(),
                    kind: e.kind(),
                    model_config: selection.model,
                    duration,
                    trace_id,
                })
            }
        }
    }

    /// Admission was denied and no free model can take the request. Nothing
    /// is dispatched, billed or recorded.
    fn refuse(
        &self,
        project_id: &str,
        model: ModelDescriptor,
        started: Instant,
        trace_id: String,
    ) -> GenerateFailure {
        let span = Span::current();
        span.record("model", model.key());
        span.record("cached", false);
        span.record("outcome", "budget_exhausted");
        self.metrics
            .increment_counter(REQUESTS_TOTAL, &[("outcome", "failure")]);
        warn!(project_id, model = model.key(), "budget exhausted and no free model available");
        GenerateFailure {
            error: format!(
                "budget exhausted for project '{project_id}' and no free model is available"
            ),
            kind: BUDGET_EXHAUSTED,
            model_config: model,
            duration: started.elapsed(),
            trace_id,
        }
    }

    /// A hit short-circuits the request: no admission, no records.
    async fn probe_cache(
        &self,
        prompt: &str,
        selection: &Selection,
        budget_fallback: bool,
        started: Instant,
        trace_id: &str,
    ) -> Option<Generated> {
        if !self.cache.is_enabled() {
            return None;
        }
        let key = ResponseCache::key(prompt, selection.model.key());
        let Some(hit) = self.cache.get(&key).await else {
            self.metrics.increment_counter(CACHE_MISSES_TOTAL, &[]);
            return None;
        };

        let span = Span::current();
        span.record("model", selection.model.key());
        span.record("cached", true);
        span.record("outcome", "success");
        self.metrics
            .increment_counter(CACHE_HITS_TOTAL, &[("tier", hit.tier)]);
        self.metrics
            .increment_counter(REQUESTS_TOTAL, &[("outcome", "cached")]);
        info!(model = selection.model.key(), tier = hit.tier, "served from cache");

        Some(Generated {
            response: hit.response,
            model_config: selection.model.clone(),
            task_type: selection.task_type,
            duration: started.elapsed(),
            cached: true,
            budget_fallback,
            trace_id: trace_id.to_string(),
            metrics: None,
        })
    }

    fn record_success(
        &self,
        ctx: &RequestContext,
        selection: &Selection,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        latency_ms: u64,
    ) {
        let model_key = selection.model.key().to_string();
        if self.budget.is_enabled() {
            let tx = self.budget.transaction_with_cost(
                Usage {
                    project_id: ctx.project().to_string(),
                    model_key: model_key.clone(),
                    tokens_in,
                    tokens_out,
                    task_type: selection.task_type,
                    session_id: ctx.session_id.clone(),
                },
                cost,
            );
            self.writer.enqueue(WriteJob::Usage(tx));
        }
        self.writer.enqueue(WriteJob::Performance(PerformanceRecord {
            id: Uuid::new_v4(),
            model_key,
            task_type: selection.task_type,
            project_id: ctx.project().to_string(),
            latency_ms,
            tokens_in,
            tokens_out,
            success: true,
            cost,
            task_id: ctx.task_id.clone(),
            session_id: ctx.session_id.clone(),
            error: None,
            created_at: self.clock.now(),
        }));
    }

    /// Fast tier inline so an immediate repeat hits; durable tier via the
    /// writer.
    async fn cache_response(&self, prompt: &str, model: &ModelDescriptor, response: &str) {
        if !self.cache.is_enabled() || response.is_empty() {
            return;
        }
        let key = ResponseCache::key(prompt, model.key());
        let entry = self.cache.entry_for(&key, response, None);
        self.cache.store_fast(&entry).await;
        if self.cache.has_durable_tier() {
            self.writer.enqueue(WriteJob::CacheStore(entry));
        }
    }

    // -----------------------------------------------------------------------
    // Budget, adapters, housekeeping
    // -----------------------------------------------------------------------

    pub async fn get_budget_status(&self, project_id: &str) -> Option<BudgetStatus> {
        match self.budget.get_budget_status(project_id).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(project_id, error = %e, "budget status unavailable");
                None
            }
        }
    }

    pub fn budget(&self) -> &BudgetLedger {
        &self.budget
    }

    pub fn list_loaded_adapters(&self) -> Vec<AdapterRecord> {
        self.adapters.loaded()
    }

    pub async fn discover_adapters(&self, dir: &Path) -> DiscoveryReport {
        let report = self.adapters.discover(dir, &self.catalog).await;
        self.metrics.set_gauge(CATALOG_MODELS, self.catalog.len() as i64);
        report
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn refresh_availability(&self) {
        self.catalog.refresh_availability().await;
    }

    /// Periodic upkeep: availability refresh plus expired-cache sweep.
    pub async fn maintain(&self) {
        self.refresh_availability().await;
        self.cache.purge_expired().await;
    }

    pub fn health_snapshot(&self) -> Vec<ModelHealth> {
        self.health.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn router_config(&self) -> &RouterConfig {
        &self.config.router
    }

    /// Wait for every queued ledger and cache write to land.
    pub async fn flush(&self) -> Result<(), WriteError> {
        self.writer.flush().await
    }

    pub async fn shutdown(&self, timeout: Duration) -> DrainResult {
        self.writer.shutdown(timeout).await
    }
}

/// `None` when storage is disabled or the database can't be opened; the
/// router then runs without cost governance.
pub async fn open_ledger(storage: &StorageConfig) -> Option<LedgerDb> {
    if !storage.enabled {
        info!("ledger storage disabled");
        return None;
    }
    let opened = if storage.in_memory {
        LedgerDb::new_in_memory().await
    } else {
        let path = storage.resolved_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(dir = %parent.display(), error = %e, "cannot create ledger directory");
            }
        }
        LedgerDb::new(&path).await
    };
    match opened {
        Ok(db) => Some(db),
        Err(e) => {
            warn!(error = %e, "ledger unavailable, budgeting and history disabled");
            None
        }
    }
}
