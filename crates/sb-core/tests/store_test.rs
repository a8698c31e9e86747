use chrono::{Duration, TimeZone, Utc};
use sb_core::store::{AdapterStore, LedgerDb, PerformanceStore, ResponseStore, SpendStore};
use sb_core::types::*;
use uuid::Uuid;

fn tx(project: &str, cost: f64, at: chrono::DateTime<Utc>) -> BudgetTransaction {
    BudgetTransaction {
        id: Uuid::new_v4(),
        project_id: project.into(),
        model_key: "gpt-4o".into(),
        cost,
        tokens_in: 100,
        tokens_out: 200,
        task_type: TaskType::General,
        session_id: None,
        timestamp: at,
    }
}

fn alert(project: &str, alert_type: AlertType) -> Alert {
    Alert {
        id: Uuid::new_v4(),
        project_id: project.into(),
        alert_type,
        threshold_pct: 80.0,
        usage: 8.0,
        limit: 10.0,
        triggered_at: Utc::now(),
        resolved_at: None,
        resolved: false,
    }
}

#[tokio::test]
async fn spend_sums_since_period_start() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

    db.append_transaction(&tx("acme", 1.25, start - Duration::days(1)))
        .await
        .unwrap();
    db.append_transaction(&tx("acme", 2.0, start)).await.unwrap();
    db.append_transaction(&tx("acme", 0.5, start + Duration::days(3)))
        .await
        .unwrap();
    db.append_transaction(&tx("other", 9.0, start)).await.unwrap();

    let total = db.sum_spend_since("acme", start).await.unwrap();
    assert!((total - 2.5).abs() < 1e-9);
    assert_eq!(db.sum_spend_since("nobody", start).await.unwrap(), 0.0);
}

#[tokio::test]
async fn transaction_append_is_idempotent_by_id() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let t = tx("acme", 1.0, Utc::now());
    db.append_transaction(&t).await.unwrap();
    db.append_transaction(&t).await.unwrap();
    assert_eq!(db.transaction_count("acme").await.unwrap(), 1);
}

#[tokio::test]
async fn project_limit_upserts() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    assert_eq!(db.project_limit("acme").await.unwrap(), None);

    db.upsert_project_limit("acme", 10.0, Utc::now()).await.unwrap();
    db.upsert_project_limit("acme", 25.0, Utc::now()).await.unwrap();
    assert_eq!(db.project_limit("acme").await.unwrap(), Some(25.0));
}

#[tokio::test]
async fn only_one_open_alert_per_type() {
    let db = LedgerDb::new_in_memory().await.unwrap();

    assert!(db
        .insert_alert_if_absent(&alert("acme", AlertType::Warning))
        .await
        .unwrap());
    assert!(!db
        .insert_alert_if_absent(&alert("acme", AlertType::Warning))
        .await
        .unwrap());
    assert!(db
        .insert_alert_if_absent(&alert("acme", AlertType::OverBudget))
        .await
        .unwrap());

    let open = db.open_alerts("acme").await.unwrap();
    assert_eq!(open.len(), 2);

    // Resolving frees the slot for a new alert of that type.
    let warning = open
        .iter()
        .find(|a| a.alert_type == AlertType::Warning)
        .unwrap();
    db.resolve_alert(warning.id, Utc::now()).await.unwrap();
    assert!(db
        .insert_alert_if_absent(&alert("acme", AlertType::Warning))
        .await
        .unwrap());

    let history = db.alert_history("acme").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|a| a.resolved).count(), 1);
    assert!(history.iter().any(|a| a.resolved_at.is_some()));
}

#[tokio::test]
async fn recent_performance_is_newest_first_and_limited() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let base = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();

    for i in 0..5 {
        let rec = PerformanceRecord {
            id: Uuid::new_v4(),
            model_key: "mistral:latest".into(),
            task_type: TaskType::Coding,
            project_id: "acme".into(),
            latency_ms: 100 * (i + 1),
            tokens_in: 10,
            tokens_out: 20,
            success: i % 2 == 0,
            cost: 0.0,
            task_id: None,
            session_id: Some("s".into()),
            error: None,
            created_at: base + Duration::seconds(i as i64),
        };
        db.append_performance(&rec).await.unwrap();
    }

    let recent = db
        .recent_performance("mistral:latest", TaskType::Coding, 3)
        .await
        .unwrap();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].latency_ms, 500);
    assert_eq!(recent[2].latency_ms, 300);

    let other_task = db
        .recent_performance("mistral:latest", TaskType::General, 10)
        .await
        .unwrap();
    assert!(other_task.is_empty());
    assert_eq!(db.performance_count().await.unwrap(), 5);
}

#[tokio::test]
async fn cached_response_expires_and_counts_hits() {
    let db = LedgerDb::new_in_memory().await.unwrap();
    let now = Utc.with_ymd_and_hms(2026, 7, 4, 8, 0, 0).unwrap();
    let entry = CacheEntry {
        key: "abc".into(),
        response: "hello".into(),
        hit_count: 0,
        expires_at: now + Duration::hours(24),
        last_accessed: now,
    };
    db.put_response(&entry).await.unwrap();

    let first = db.get_response("abc", now).await.unwrap().unwrap();
    assert_eq!(first.response, "hello");
    assert_eq!(first.hit_count, 1);
    let second = db
        .get_response("abc", now + Duration::hours(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.hit_count, 2);
    // no sliding expiry
    assert_eq!(second.expires_at, entry.expires_at);

    assert!(db
        .get_response("abc", now + Duration::hours(24))
        .await
        .unwrap()
        .is_none());
    assert_eq!(db.purge_expired(now + Duration::hours(25)).await.unwrap(), 1);
}

#[tokio::test]
async fn adapters_persist_and_upsert() {
    let dir = tempfile::tempdir().unwrap();
    let db = LedgerDb::new(dir.path().join("ledger.db")).await.unwrap();
    let record = AdapterRecord {
        adapter_name: "adapter_x".into(),
        base_model: "mistral:latest".into(),
        training_sample_count: 120,
        loaded_at: Utc::now(),
        artifact_path: dir.path().join("adapter_x"),
    };
    db.upsert_adapter(&record).await.unwrap();
    db.upsert_adapter(&record).await.unwrap();

    let reopened = LedgerDb::new(dir.path().join("ledger.db")).await.unwrap();
    let adapters = reopened.list_adapters().await.unwrap();
    assert_eq!(adapters.len(), 1);
    assert_eq!(adapters[0].model_key(), "mistral:latest+adapter_x");
    assert_eq!(adapters[0].training_sample_count, 120);
}
