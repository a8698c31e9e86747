//! Per-project spend accounting and admission control.
//!
//! Spend is never kept as a counter. Every billed call appends a
//! [`BudgetTransaction`] and a project's usage is the sum of its transactions
//! since the start of the current billing period, so concurrent requests can
//! not lose updates. The derived [`BudgetStatus`] is cached for a short TTL
//! and invalidated right after each append.
//!
//! Usage bands, in increasing severity:
//!
//! ```text
//! under threshold -> warning (pct >= warn%) -> limit_reached (pct >= 100) -> over_budget (usage > limit)
//! ```
//!
//! Entering a band opens at most one alert of that type; falling back below
//! a band resolves the open alerts above it.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use sb_core::clock::SharedClock;
use sb_core::config::BudgetConfig;
use sb_core::store::{SpendStore, StoreError};
use sb_core::types::{
    Alert, AlertType, BudgetStatus, BudgetTransaction, ModelDescriptor, TaskType,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pricing::{ModelPrice, PriceTable};

/// Inputs to [`BudgetLedger::record_usage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub project_id: String,
    pub model_key: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub task_type: TaskType,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedStatus {
    status: BudgetStatus,
    computed_at: DateTime<Utc>,
}

pub struct BudgetLedger {
    config: BudgetConfig,
    store: Option<Arc<dyn SpendStore>>,
    prices: PriceTable,
    clock: SharedClock,
    limits: DashMap<String, f64>,
    status_cache: DashMap<String, CachedStatus>,
}

impl BudgetLedger {
    pub fn new(
        config: BudgetConfig,
        store: Option<Arc<dyn SpendStore>>,
        prices: PriceTable,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            store,
            prices,
            clock,
            limits: DashMap::new(),
            status_cache: DashMap::new(),
        }
    }

    /// Budgeting is active only when enabled and a ledger store is attached.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.store.is_some()
    }

    pub fn calculate_cost(&self, model_key: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.prices.cost(model_key, tokens_in, tokens_out)
    }

    /// Like [`calculate_cost`](Self::calculate_cost), but a model missing
    /// from the price table is priced from its own descriptor.
    pub fn cost_for_model(&self, model: &ModelDescriptor, tokens_in: u64, tokens_out: u64) -> f64 {
        self.price_for(model).cost(tokens_in, tokens_out)
    }

    /// Whether dispatching to `model` is billed, judged from the same prices
    /// [`cost_for_model`](Self::cost_for_model) charges. A descriptor built
    /// without prices still counts as paid when the table prices its key.
    pub fn is_paid(&self, model: &ModelDescriptor) -> bool {
        !self.price_for(model).is_free()
    }

    fn price_for(&self, model: &ModelDescriptor) -> ModelPrice {
        self.prices
            .lookup(model.key())
            .unwrap_or_else(|| ModelPrice::of(model))
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Price `usage` and stamp it with a fresh id. The id makes later appends
    /// of the same transaction idempotent.
    pub fn transaction_for(&self, usage: Usage) -> BudgetTransaction {
        let cost = self.calculate_cost(&usage.model_key, usage.tokens_in, usage.tokens_out);
        self.transaction_with_cost(usage, cost)
    }

    pub fn transaction_with_cost(&self, usage: Usage, cost: f64) -> BudgetTransaction {
        BudgetTransaction {
            id: Uuid::new_v4(),
            project_id: usage.project_id,
            model_key: usage.model_key,
            cost,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            task_type: usage.task_type,
            session_id: usage.session_id,
            timestamp: self.clock.now(),
        }
    }

    /// Price and append one call. `Ok(None)` when budgeting is inactive.
    pub async fn record_usage(&self, usage: Usage) -> Result<Option<BudgetTransaction>, StoreError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let tx = self.transaction_for(usage);
        self.append(&tx).await?;
        Ok(Some(tx))
    }

    /// Durably append `tx`, invalidate the project's cached status, then
    /// evaluate alert transitions. Only the append can fail; alert problems
    /// are logged here.
    pub async fn append(&self, tx: &BudgetTransaction) -> Result<(), StoreError> {
        let Some(store) = self.active_store() else {
            return Ok(());
        };
        store.append_transaction(tx).await?;
        self.invalidate(&tx.project_id);
        debug!(
            project_id = %tx.project_id,
            model = %tx.model_key,
            cost = tx.cost,
            "spend recorded"
        );
        self.evaluate_alerts_logged(&tx.project_id).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn get_budget_status(&self, project_id: &str) -> Result<BudgetStatus, StoreError> {
        let now = self.clock.now();
        if let Some(cached) = self.status_cache.get(project_id) {
            if now - cached.computed_at < self.status_ttl() {
                return Ok(cached.status.clone());
            }
        }
        let status = self.compute_status(project_id, now).await?;
        self.status_cache.insert(
            project_id.to_string(),
            CachedStatus {
                status: status.clone(),
                computed_at: now,
            },
        );
        Ok(status)
    }

    async fn compute_status(
        &self,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BudgetStatus, StoreError> {
        let (period_start, period_end) = billing_period(now, self.config.reset_day);
        let limit = self.limit_for(project_id).await?;
        let usage = match &self.store {
            Some(store) => store.sum_spend_since(project_id, period_start).await?,
            None => 0.0,
        };

        let pct_used = if limit > 0.0 {
            usage / limit * 100.0
        } else {
            100.0
        };
        let days_elapsed = (now - period_start).num_days().max(1);
        let days_remaining = (period_end.date_naive() - now.date_naive()).num_days().max(0);

        Ok(BudgetStatus {
            project_id: project_id.to_string(),
            limit,
            usage,
            remaining: (limit - usage).max(0.0),
            pct_used,
            over_budget: usage > limit,
            warning_reached: pct_used >= self.config.warning_threshold_pct,
            days_remaining,
            period_start,
            period_end,
            estimated_monthly_cost: usage / days_elapsed as f64 * 30.0,
        })
    }

    async fn limit_for(&self, project_id: &str) -> Result<f64, StoreError> {
        if let Some(limit) = self.limits.get(project_id) {
            return Ok(*limit);
        }
        if let Some(store) = &self.store {
            if let Some(limit) = store.project_limit(project_id).await? {
                return Ok(limit);
            }
        }
        Ok(self
            .config
            .projects
            .get(project_id)
            .copied()
            .unwrap_or(self.config.default_monthly_limit))
    }

    fn status_ttl(&self) -> Duration {
        Duration::seconds(self.config.status_ttl_secs.min(86_400) as i64)
    }

    fn invalidate(&self, project_id: &str) {
        self.status_cache.remove(project_id);
    }

    fn active_store(&self) -> Option<&Arc<dyn SpendStore>> {
        if self.config.enabled {
            self.store.as_ref()
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// The gate in front of every paid dispatch.
    ///
    /// Fails open when budgeting or auto-fallback is off, or when the ledger
    /// can't be read. Fails closed once usage has reached the limit, or when
    /// `estimated_cost` would push usage past it.
    pub async fn should_use_paid_model(&self, project_id: &str, estimated_cost: Option<f64>) -> bool {
        if !self.config.enabled || !self.config.auto_fallback || self.store.is_none() {
            return true;
        }
        let status = match self.get_budget_status(project_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(project_id, error = %e, "budget status unavailable, allowing paid model");
                return true;
            }
        };
        if status.usage >= status.limit {
            info!(project_id, usage = status.usage, limit = status.limit, "budget exhausted");
            return false;
        }
        if let Some(estimate) = estimated_cost {
            if status.usage + estimate > status.limit {
                info!(
                    project_id,
                    usage = status.usage,
                    estimate,
                    limit = status.limit,
                    "estimated cost would exceed budget"
                );
                return false;
            }
        }
        true
    }

    /// Upsert a per-project limit, then re-evaluate alerts against it.
    pub async fn set_project_budget(&self, project_id: &str, limit: f64) -> Result<(), StoreError> {
        let limit = limit.max(0.0);
        if let Some(store) = &self.store {
            store
                .upsert_project_limit(project_id, limit, self.clock.now())
                .await?;
        }
        self.limits.insert(project_id.to_string(), limit);
        self.invalidate(project_id);
        info!(project_id, limit, "project budget set");
        self.evaluate_alerts_logged(project_id).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn open_alerts(&self, project_id: &str) -> Result<Vec<Alert>, StoreError> {
        match &self.store {
            Some(store) => store.open_alerts(project_id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn alert_history(&self, project_id: &str) -> Result<Vec<Alert>, StoreError> {
        match &self.store {
            Some(store) => store.alert_history(project_id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn evaluate_alerts_logged(&self, project_id: &str) {
        if let Err(e) = self.evaluate_alerts(project_id).await {
            warn!(project_id, error = %e, "alert evaluation failed");
        }
    }

    async fn evaluate_alerts(&self, project_id: &str) -> Result<(), StoreError> {
        let Some(store) = self.active_store() else {
            return Ok(());
        };
        let status = self.get_budget_status(project_id).await?;
        let band = self.band(&status);
        let now = self.clock.now();
        let open = store.open_alerts(project_id).await?;

        for alert in &open {
            if band.map_or(true, |b| alert.alert_type > b) {
                store.resolve_alert(alert.id, now).await?;
                info!(project_id, alert = %alert.alert_type, "budget alert resolved");
            }
        }

        let Some(band) = band else {
            return Ok(());
        };
        if open.iter().any(|a| a.alert_type == band) {
            return Ok(());
        }
        let alert = Alert {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            alert_type: band,
            threshold_pct: match band {
                AlertType::Warning => self.config.warning_threshold_pct,
                AlertType::LimitReached | AlertType::OverBudget => 100.0,
            },
            usage: status.usage,
            limit: status.limit,
            triggered_at: now,
            resolved_at: None,
            resolved: false,
        };
        if store.insert_alert_if_absent(&alert).await? {
            warn!(
                project_id,
                alert = %band,
                usage = status.usage,
                limit = status.limit,
                pct_used = status.pct_used,
                "budget alert raised"
            );
        }
        Ok(())
    }

    fn band(&self, status: &BudgetStatus) -> Option<AlertType> {
        if status.usage > status.limit {
            Some(AlertType::OverBudget)
        } else if status.pct_used >= 100.0 {
            Some(AlertType::LimitReached)
        } else if status.pct_used >= self.config.warning_threshold_pct {
            Some(AlertType::Warning)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Billing period
// ---------------------------------------------------------------------------

fn period_anchor(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    // day is clamped to 1..=28 by the caller, so the date always exists
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

/// `[start, end)` of the billing period containing `now`. Before the reset
/// day the period began on the reset day of the previous month.
pub fn billing_period(now: DateTime<Utc>, reset_day: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = reset_day.clamp(1, 28);
    let (y, m) = (now.year(), now.month());
    let (start_ym, end_ym) = if now.day() < day {
        (shift_month(y, m, -1), (y, m))
    } else {
        ((y, m), shift_month(y, m, 1))
    };
    (
        period_anchor(start_ym.0, start_ym.1, day),
        period_anchor(end_ym.0, end_ym.1, day),
    )
}
