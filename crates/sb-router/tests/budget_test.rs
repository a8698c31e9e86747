//! Budget ledger against an in-memory SQLite ledger and a manual clock.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use sb_core::clock::{Clock, ManualClock, SharedClock};
use sb_core::config::BudgetConfig;
use sb_core::store::{LedgerDb, SpendStore};
use sb_core::types::{AlertType, BudgetTransaction, ModelDescriptor, Provider, TaskType};
use sb_router::budget::{billing_period, BudgetLedger, Usage};
use sb_router::pricing::PriceTable;
use uuid::Uuid;

// ===========================================================================
// Helpers
// ===========================================================================

/// $1 per 1k tokens either way, so 1000 tokens == $1.00.
fn prices() -> PriceTable {
    PriceTable::from_catalog(&[
        ModelDescriptor::new(Provider::OpenAi, "paid").with_pricing(1.0, 1.0),
        ModelDescriptor::new(Provider::Ollama, "local"),
    ])
}

fn april(day: u32) -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 4, day, 12, 0, 0).unwrap())
}

async fn ledger_with(config: BudgetConfig, clock: &ManualClock) -> (BudgetLedger, LedgerDb) {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let shared: SharedClock = Arc::new(clock.clone());
    let ledger = BudgetLedger::new(config, Some(Arc::new(db.clone())), prices(), shared);
    (ledger, db)
}

async fn ledger(clock: &ManualClock) -> (BudgetLedger, LedgerDb) {
    ledger_with(BudgetConfig::default(), clock).await
}

fn usage(project: &str, tokens: u64) -> Usage {
    Usage {
        project_id: project.into(),
        model_key: "paid".into(),
        tokens_in: tokens,
        tokens_out: 0,
        task_type: TaskType::General,
        session_id: Some("s-1".into()),
    }
}

fn raw_tx(project: &str, cost: f64, at: chrono::DateTime<Utc>) -> BudgetTransaction {
    BudgetTransaction {
        id: Uuid::new_v4(),
        project_id: project.into(),
        model_key: "paid".into(),
        cost,
        tokens_in: 0,
        tokens_out: 0,
        task_type: TaskType::General,
        session_id: None,
        timestamp: at,
    }
}

// ===========================================================================
// Recording and status
// ===========================================================================

#[tokio::test]
async fn record_usage_appends_priced_transaction() {
    let clock = april(10);
    let (ledger, db) = ledger(&clock).await;

    let tx = ledger.record_usage(usage("acme", 1500)).await.unwrap().unwrap();
    assert_eq!(tx.cost, 1.5);
    assert_eq!(tx.session_id.as_deref(), Some("s-1"));
    assert_eq!(db.transaction_count("acme").await.unwrap(), 1);

    let status = ledger.get_budget_status("acme").await.unwrap();
    assert_eq!(status.usage, 1.5);
    assert_eq!(status.limit, 100.0);
    assert_eq!(status.remaining, 98.5);
    assert!(!status.over_budget);
}

#[tokio::test]
async fn free_models_record_zero_cost() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    let mut free = usage("acme", 50_000);
    free.model_key = "local".into();
    let tx = ledger.record_usage(free).await.unwrap().unwrap();
    assert_eq!(tx.cost, 0.0);
}

#[tokio::test]
async fn paid_is_judged_by_billing_prices() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;

    // the table prices "paid" even though this descriptor carries no prices
    assert!(ledger.is_paid(&ModelDescriptor::new(Provider::OpenAi, "paid")));
    assert!(!ledger.is_paid(&ModelDescriptor::new(Provider::Ollama, "local")));
    // adapters are priced from their base
    assert!(ledger.is_paid(&ModelDescriptor::new(Provider::OpenAi, "paid+tuned")));
    // unknown to the table: the descriptor's own prices decide
    assert!(ledger.is_paid(
        &ModelDescriptor::new(Provider::Anthropic, "elsewhere").with_pricing(0.5, 0.5)
    ));
    assert!(!ledger.is_paid(&ModelDescriptor::new(Provider::Ollama, "elsewhere")));
}

#[tokio::test]
async fn status_is_cached_until_ttl_or_append() {
    let clock = april(10);
    let (ledger, db) = ledger(&clock).await;
    assert_eq!(ledger.get_budget_status("acme").await.unwrap().usage, 0.0);

    // written behind the ledger's back: no invalidation
    db.append_transaction(&raw_tx("acme", 4.0, clock.now()))
        .await
        .unwrap();
    assert_eq!(ledger.get_budget_status("acme").await.unwrap().usage, 0.0);

    clock.advance(Duration::seconds(301));
    assert_eq!(ledger.get_budget_status("acme").await.unwrap().usage, 4.0);

    // appends through the ledger invalidate immediately
    ledger.record_usage(usage("acme", 1000)).await.unwrap();
    assert_eq!(ledger.get_budget_status("acme").await.unwrap().usage, 5.0);
}

#[tokio::test]
async fn usage_only_counts_the_current_period() {
    let clock = april(20);
    let config = BudgetConfig {
        reset_day: 15,
        ..BudgetConfig::default()
    };
    let (ledger, db) = ledger_with(config, &clock).await;

    let before = Utc.with_ymd_and_hms(2026, 4, 14, 23, 59, 0).unwrap();
    let after = Utc.with_ymd_and_hms(2026, 4, 16, 8, 0, 0).unwrap();
    db.append_transaction(&raw_tx("acme", 7.0, before)).await.unwrap();
    db.append_transaction(&raw_tx("acme", 2.0, after)).await.unwrap();

    let status = ledger.get_budget_status("acme").await.unwrap();
    assert_eq!(status.usage, 2.0);
    assert_eq!(status.period_start, Utc.with_ymd_and_hms(2026, 4, 15, 0, 0, 0).unwrap());
    assert_eq!(status.period_end, Utc.with_ymd_and_hms(2026, 5, 15, 0, 0, 0).unwrap());
}

#[tokio::test]
async fn monthly_projection_and_days_remaining() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 11, 0, 0, 0).unwrap());
    let (ledger, _) = ledger(&clock).await;
    ledger.record_usage(usage("acme", 5000)).await.unwrap();

    let status = ledger.get_budget_status("acme").await.unwrap();
    // ten days into the period, $5 spent
    assert!((status.estimated_monthly_cost - 15.0).abs() < 1e-9);
    assert_eq!(status.days_remaining, 20);
}

#[test]
fn period_boundary_before_reset_day() {
    let now = Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap();
    let (start, end) = billing_period(now, 10);
    assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap());
    assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap());
}

// ===========================================================================
// Admission control
// ===========================================================================

#[tokio::test]
async fn estimate_that_would_overrun_is_refused() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("acme", 10.0).await.unwrap();
    ledger.record_usage(usage("acme", 9500)).await.unwrap();

    assert!(!ledger.should_use_paid_model("acme", Some(1.0)).await);
    assert!(ledger.should_use_paid_model("acme", Some(0.25)).await);
    assert!(ledger.should_use_paid_model("acme", None).await);
}

#[tokio::test]
async fn exhausted_budget_fails_closed() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("acme", 10.0).await.unwrap();
    assert!(ledger.should_use_paid_model("acme", None).await);

    ledger.record_usage(usage("acme", 10_000)).await.unwrap();
    assert!(!ledger.should_use_paid_model("acme", None).await);
    assert!(!ledger.should_use_paid_model("acme", Some(0.0)).await);
}

#[tokio::test]
async fn zero_limit_refuses_everything_paid() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("frozen", 0.0).await.unwrap();
    let status = ledger.get_budget_status("frozen").await.unwrap();
    assert_eq!(status.pct_used, 100.0);
    assert!(!ledger.should_use_paid_model("frozen", None).await);
}

#[tokio::test]
async fn disabled_budgeting_fails_open_and_records_nothing() {
    let clock = april(10);
    let config = BudgetConfig {
        enabled: false,
        default_monthly_limit: 0.0,
        ..BudgetConfig::default()
    };
    let (ledger, db) = ledger_with(config, &clock).await;

    assert!(!ledger.is_enabled());
    assert!(ledger.should_use_paid_model("acme", Some(1_000.0)).await);
    assert!(ledger.record_usage(usage("acme", 1000)).await.unwrap().is_none());
    assert_eq!(db.transaction_count("acme").await.unwrap(), 0);
}

#[tokio::test]
async fn auto_fallback_off_always_admits() {
    let clock = april(10);
    let config = BudgetConfig {
        auto_fallback: false,
        ..BudgetConfig::default()
    };
    let (ledger, _) = ledger_with(config, &clock).await;
    ledger.set_project_budget("acme", 1.0).await.unwrap();
    ledger.record_usage(usage("acme", 5000)).await.unwrap();
    assert!(ledger.should_use_paid_model("acme", None).await);
    // still tracked
    assert!(ledger.get_budget_status("acme").await.unwrap().over_budget);
}

#[tokio::test]
async fn missing_store_fails_open() {
    let clock: SharedClock = Arc::new(april(10));
    let ledger = BudgetLedger::new(BudgetConfig::default(), None, prices(), clock);

    assert!(!ledger.is_enabled());
    assert!(ledger.should_use_paid_model("acme", Some(1e9)).await);
    assert!(ledger.record_usage(usage("acme", 1000)).await.unwrap().is_none());
    let status = ledger.get_budget_status("acme").await.unwrap();
    assert_eq!(status.usage, 0.0);
    assert!(ledger.open_alerts("acme").await.unwrap().is_empty());
}

// ===========================================================================
// Limits
// ===========================================================================

#[tokio::test]
async fn limit_precedence() {
    let clock = april(10);
    let config = BudgetConfig {
        default_monthly_limit: 50.0,
        projects: [("seeded".to_string(), 20.0)].into_iter().collect(),
        ..BudgetConfig::default()
    };
    let (ledger, db) = ledger_with(config.clone(), &clock).await;

    assert_eq!(ledger.get_budget_status("other").await.unwrap().limit, 50.0);
    assert_eq!(ledger.get_budget_status("seeded").await.unwrap().limit, 20.0);

    ledger.set_project_budget("seeded", 35.0).await.unwrap();
    assert_eq!(ledger.get_budget_status("seeded").await.unwrap().limit, 35.0);

    // a fresh ledger over the same database sees the persisted override
    let shared: SharedClock = Arc::new(clock.clone());
    let reopened = BudgetLedger::new(config, Some(Arc::new(db)), prices(), shared);
    assert_eq!(reopened.get_budget_status("seeded").await.unwrap().limit, 35.0);
}

// ===========================================================================
// Alerts
// ===========================================================================

#[tokio::test]
async fn alerts_are_deduplicated_per_band() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("acme", 10.0).await.unwrap();

    ledger.record_usage(usage("acme", 8500)).await.unwrap();
    for _ in 0..2 {
        ledger.record_usage(usage("acme", 250)).await.unwrap();
    }
    let open = ledger.open_alerts("acme").await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].alert_type, AlertType::Warning);
    assert_eq!(open[0].threshold_pct, 80.0);

    // exactly at the limit
    ledger.record_usage(usage("acme", 1000)).await.unwrap();
    let types: Vec<AlertType> = ledger
        .open_alerts("acme")
        .await
        .unwrap()
        .iter()
        .map(|a| a.alert_type)
        .collect();
    assert_eq!(types, vec![AlertType::Warning, AlertType::LimitReached]);

    for _ in 0..3 {
        ledger.record_usage(usage("acme", 1000)).await.unwrap();
    }
    let open = ledger.open_alerts("acme").await.unwrap();
    assert_eq!(open.len(), 3);
    for t in [AlertType::Warning, AlertType::LimitReached, AlertType::OverBudget] {
        assert_eq!(open.iter().filter(|a| a.alert_type == t).count(), 1);
    }
}

#[tokio::test]
async fn raising_the_limit_resolves_open_alerts() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("acme", 10.0).await.unwrap();
    ledger.record_usage(usage("acme", 12_000)).await.unwrap();
    assert_eq!(ledger.open_alerts("acme").await.unwrap().len(), 1);

    ledger.set_project_budget("acme", 14.0).await.unwrap();
    let open = ledger.open_alerts("acme").await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].alert_type, AlertType::Warning);

    ledger.set_project_budget("acme", 1_000.0).await.unwrap();
    assert!(ledger.open_alerts("acme").await.unwrap().is_empty());

    let history = ledger.alert_history("acme").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|a| a.resolved && a.resolved_at.is_some()));
}

#[tokio::test]
async fn below_threshold_raises_nothing() {
    let clock = april(10);
    let (ledger, _) = ledger(&clock).await;
    ledger.set_project_budget("acme", 10.0).await.unwrap();
    ledger.record_usage(usage("acme", 7900)).await.unwrap();
    assert!(ledger.alert_history("acme").await.unwrap().is_empty());
}
