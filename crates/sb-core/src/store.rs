//! Durable ledger storage.
//!
//! Each concern the gateway persists is expressed as a narrow async trait so
//! ledgers can be exercised against fakes, and [`LedgerDb`] implements all of
//! them over one SQLite connection. Ledger tables are append-only; the only
//! mutations are idempotent upserts, alert resolution, and cache hit counters.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    AdapterRecord, Alert, AlertType, BudgetTransaction, CacheEntry, PerformanceRecord, TaskType,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SpendStore: Send + Sync {
    /// Append a transaction. Re-appending the same id is a no-op.
    async fn append_transaction(&self, tx: &BudgetTransaction) -> Result<(), StoreError>;
    async fn sum_spend_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError>;
    async fn project_limit(&self, project_id: &str) -> Result<Option<f64>, StoreError>;
    async fn upsert_project_limit(
        &self,
        project_id: &str,
        limit: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Insert unless an unresolved alert of the same type is open. Returns
    /// whether a row was written.
    async fn insert_alert_if_absent(&self, alert: &Alert) -> Result<bool, StoreError>;
    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn open_alerts(&self, project_id: &str) -> Result<Vec<Alert>, StoreError>;
    async fn alert_history(&self, project_id: &str) -> Result<Vec<Alert>, StoreError>;
}

#[async_trait]
pub trait PerformanceStore: Send + Sync {
    async fn append_performance(&self, record: &PerformanceRecord) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_performance(
        &self,
        model_key: &str,
        task_type: TaskType,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>, StoreError>;
}

#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Fetch a live entry, bumping its hit count and access time. Expired
    /// entries read as `None`.
    async fn get_response(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError>;
    async fn put_response(&self, entry: &CacheEntry) -> Result<(), StoreError>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait AdapterStore: Send + Sync {
    async fn upsert_adapter(&self, record: &AdapterRecord) -> Result<(), StoreError>;
    async fn list_adapters(&self) -> Result<Vec<AdapterRecord>, StoreError>;
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so lexical order equals chronological order.
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parsed_col<T: FromStr<Err = String>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| parse_error(idx, e))
}

const OVERRIDE_PROJECT_BUDGET: &str = "project_budget";
const OVERRIDE_ADAPTER: &str = "adapter";

#[derive(Serialize, Deserialize)]
struct BudgetOverride {
    limit: f64,
}

#[derive(Serialize, Deserialize)]
struct AdapterOverride {
    adapter_name: String,
    base_model: String,
    training_sample_count: u64,
    loaded_at: DateTime<Utc>,
    artifact_path: PathBuf,
}

// ---------------------------------------------------------------------------
// LedgerDb
// ---------------------------------------------------------------------------

/// Async SQLite-backed ledger for spend, performance, alerts, adapter
/// registrations and durable cached responses.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Connection,
}

impl LedgerDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS performance_records (
                        id          TEXT PRIMARY KEY,
                        model_key   TEXT NOT NULL,
                        task_type   TEXT NOT NULL,
                        project_id  TEXT NOT NULL,
                        latency_ms  INTEGER NOT NULL,
                        tokens_in   INTEGER NOT NULL,
                        tokens_out  INTEGER NOT NULL,
                        success     INTEGER NOT NULL,
                        cost        REAL NOT NULL,
                        task_id     TEXT,
                        session_id  TEXT,
                        error       TEXT,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_perf_model_task
                        ON performance_records(model_key, task_type, created_at);

                    CREATE TABLE IF NOT EXISTS budget_transactions (
                        id          TEXT PRIMARY KEY,
                        project_id  TEXT NOT NULL,
                        model_key   TEXT NOT NULL,
                        cost        REAL NOT NULL,
                        tokens_in   INTEGER NOT NULL,
                        tokens_out  INTEGER NOT NULL,
                        task_type   TEXT NOT NULL,
                        session_id  TEXT,
                        timestamp   TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tx_project_time
                        ON budget_transactions(project_id, timestamp);

                    CREATE TABLE IF NOT EXISTS budget_alerts (
                        id            TEXT PRIMARY KEY,
                        project_id    TEXT NOT NULL,
                        alert_type    TEXT NOT NULL,
                        threshold_pct REAL NOT NULL,
                        usage         REAL NOT NULL,
                        limit_amount  REAL NOT NULL,
                        triggered_at  TEXT NOT NULL,
                        resolved_at   TEXT,
                        resolved      INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_one_open
                        ON budget_alerts(project_id, alert_type) WHERE resolved = 0;

                    CREATE TABLE IF NOT EXISTS catalog_overrides (
                        kind        TEXT NOT NULL,
                        name        TEXT NOT NULL,
                        payload     TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        PRIMARY KEY (kind, name)
                    );

                    CREATE TABLE IF NOT EXISTS response_cache (
                        key           TEXT PRIMARY KEY,
                        response      TEXT NOT NULL,
                        hit_count     INTEGER NOT NULL DEFAULT 0,
                        expires_at    TEXT NOT NULL,
                        last_accessed TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_cache_expiry ON response_cache(expires_at);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn transaction_count(&self, project_id: &str) -> Result<u64, StoreError> {
        let project_id = project_id.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM budget_transactions WHERE project_id = ?1",
                    rusqlite::params![project_id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    pub async fn performance_count(&self) -> Result<u64, StoreError> {
        let n = self
            .conn
            .call(|conn| {
                let n: u64 =
                    conn.query_row("SELECT COUNT(*) FROM performance_records", [], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    async fn upsert_override(
        &self,
        kind: &'static str,
        name: String,
        payload: String,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated_at = ts_to_sql(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO catalog_overrides (kind, name, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(kind, name) DO UPDATE SET
                        payload=excluded.payload, updated_at=excluded.updated_at",
                    rusqlite::params![kind, name, payload, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn select_alerts(
        &self,
        project_id: &str,
        only_open: bool,
    ) -> Result<Vec<Alert>, StoreError> {
        let project_id = project_id.to_string();
        let alerts = self
            .conn
            .call(move |conn| {
                let sql = if only_open {
                    "SELECT id, project_id, alert_type, threshold_pct, usage, limit_amount,
                            triggered_at, resolved_at, resolved
                     FROM budget_alerts WHERE project_id = ?1 AND resolved = 0
                     ORDER BY triggered_at, rowid"
                } else {
                    "SELECT id, project_id, alert_type, threshold_pct, usage, limit_amount,
                            triggered_at, resolved_at, resolved
                     FROM budget_alerts WHERE project_id = ?1
                     ORDER BY triggered_at, rowid"
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_alert(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(alerts)
    }
}

#[async_trait]
impl SpendStore for LedgerDb {
    async fn append_transaction(&self, tx: &BudgetTransaction) -> Result<(), StoreError> {
        let id = tx.id.to_string();
        let project_id = tx.project_id.clone();
        let model_key = tx.model_key.clone();
        let cost = tx.cost;
        let tokens_in = tx.tokens_in as i64;
        let tokens_out = tx.tokens_out as i64;
        let task_type = tx.task_type.as_str();
        let session_id = tx.session_id.clone();
        let timestamp = ts_to_sql(tx.timestamp);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO budget_transactions (id, project_id, model_key, cost,
                        tokens_in, tokens_out, task_type, session_id, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id, project_id, model_key, cost, tokens_in, tokens_out, task_type,
                        session_id, timestamp,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn sum_spend_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<f64, StoreError> {
        let project_id = project_id.to_string();
        let since = ts_to_sql(since);
        let total = self
            .conn
            .call(move |conn| {
                let total: f64 = conn.query_row(
                    "SELECT COALESCE(SUM(cost), 0.0) FROM budget_transactions
                     WHERE project_id = ?1 AND timestamp >= ?2",
                    rusqlite::params![project_id, since],
                    |r| r.get(0),
                )?;
                Ok(total)
            })
            .await?;
        Ok(total)
    }

    async fn project_limit(&self, project_id: &str) -> Result<Option<f64>, StoreError> {
        let name = project_id.to_string();
        let payload = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload FROM catalog_overrides WHERE kind = ?1 AND name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![OVERRIDE_PROJECT_BUDGET, name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<BudgetOverride>(&raw)?.limit)),
            None => Ok(None),
        }
    }

    async fn upsert_project_limit(
        &self,
        project_id: &str,
        limit: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&BudgetOverride { limit })?;
        self.upsert_override(OVERRIDE_PROJECT_BUDGET, project_id.to_string(), payload, at)
            .await
    }

    async fn insert_alert_if_absent(&self, alert: &Alert) -> Result<bool, StoreError> {
        let id = alert.id.to_string();
        let project_id = alert.project_id.clone();
        let alert_type = alert.alert_type.as_str();
        let threshold_pct = alert.threshold_pct;
        let usage = alert.usage;
        let limit = alert.limit;
        let triggered_at = ts_to_sql(alert.triggered_at);
        let resolved_at = alert.resolved_at.map(ts_to_sql);
        let resolved = alert.resolved;

        let written = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO budget_alerts (id, project_id, alert_type,
                        threshold_pct, usage, limit_amount, triggered_at, resolved_at, resolved)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id, project_id, alert_type, threshold_pct, usage, limit, triggered_at,
                        resolved_at, resolved,
                    ],
                )?;
                Ok(n == 1)
            })
            .await?;
        Ok(written)
    }

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let id = alert_id.to_string();
        let resolved_at = ts_to_sql(at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE budget_alerts SET resolved = 1, resolved_at = ?2
                     WHERE id = ?1 AND resolved = 0",
                    rusqlite::params![id, resolved_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn open_alerts(&self, project_id: &str) -> Result<Vec<Alert>, StoreError> {
        self.select_alerts(project_id, true).await
    }

    async fn alert_history(&self, project_id: &str) -> Result<Vec<Alert>, StoreError> {
        self.select_alerts(project_id, false).await
    }
}

#[async_trait]
impl PerformanceStore for LedgerDb {
    async fn append_performance(&self, record: &PerformanceRecord) -> Result<(), StoreError> {
        let id = record.id.to_string();
        let model_key = record.model_key.clone();
        let task_type = record.task_type.as_str();
        let project_id = record.project_id.clone();
        let latency_ms = record.latency_ms as i64;
        let tokens_in = record.tokens_in as i64;
        let tokens_out = record.tokens_out as i64;
        let success = record.success;
        let cost = record.cost;
        let task_id = record.task_id.clone();
        let session_id = record.session_id.clone();
        let error = record.error.clone();
        let created_at = ts_to_sql(record.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO performance_records (id, model_key, task_type,
                        project_id, latency_ms, tokens_in, tokens_out, success, cost, task_id,
                        session_id, error, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    rusqlite::params![
                        id, model_key, task_type, project_id, latency_ms, tokens_in, tokens_out,
                        success, cost, task_id, session_id, error, created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recent_performance(
        &self,
        model_key: &str,
        task_type: TaskType,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let model_key = model_key.to_string();
        let task_type = task_type.as_str();
        let limit = limit as i64;
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, model_key, task_type, project_id, latency_ms, tokens_in,
                            tokens_out, success, cost, task_id, session_id, error, created_at
                     FROM performance_records
                     WHERE model_key = ?1 AND task_type = ?2
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![model_key, task_type, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_performance(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl ResponseStore for LedgerDb {
    async fn get_response(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let key = key.to_string();
        let now = ts_to_sql(now);
        let entry = self
            .conn
            .call(move |conn| {
                let touched = conn.execute(
                    "UPDATE response_cache SET hit_count = hit_count + 1, last_accessed = ?2
                     WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now],
                )?;
                if touched == 0 {
                    return Ok(None);
                }
                let mut stmt = conn.prepare(
                    "SELECT key, response, hit_count, expires_at, last_accessed
                     FROM response_cache WHERE key = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_cache_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(entry)
    }

    async fn put_response(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let key = entry.key.clone();
        let response = entry.response.clone();
        let hit_count = entry.hit_count as i64;
        let expires_at = ts_to_sql(entry.expires_at);
        let last_accessed = ts_to_sql(entry.last_accessed);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO response_cache (key, response, hit_count, expires_at, last_accessed)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(key) DO UPDATE SET
                        response=excluded.response, expires_at=excluded.expires_at,
                        last_accessed=excluded.last_accessed,
                        hit_count=MAX(response_cache.hit_count, excluded.hit_count)",
                    rusqlite::params![key, response, hit_count, expires_at, last_accessed],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now = ts_to_sql(now);
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM response_cache WHERE expires_at <= ?1",
                    rusqlite::params![now],
                )?;
                Ok(n)
            })
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl AdapterStore for LedgerDb {
    async fn upsert_adapter(&self, record: &AdapterRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&AdapterOverride {
            adapter_name: record.adapter_name.clone(),
            base_model: record.base_model.clone(),
            training_sample_count: record.training_sample_count,
            loaded_at: record.loaded_at,
            artifact_path: record.artifact_path.clone(),
        })?;
        self.upsert_override(OVERRIDE_ADAPTER, record.model_key(), payload, record.loaded_at)
            .await
    }

    async fn list_adapters(&self) -> Result<Vec<AdapterRecord>, StoreError> {
        let payloads = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT payload FROM catalog_overrides WHERE kind = ?1
                     ORDER BY updated_at, rowid",
                )?;
                let mut rows = stmt.query(rusqlite::params![OVERRIDE_ADAPTER])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await?;

        let mut records = Vec::with_capacity(payloads.len());
        for raw in payloads {
            let o: AdapterOverride = serde_json::from_str(&raw)?;
            records.push(AdapterRecord {
                adapter_name: o.adapter_name,
                base_model: o.base_model,
                training_sample_count: o.training_sample_count,
                loaded_at: o.loaded_at,
                artifact_path: o.artifact_path,
            });
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: uuid_col(row, 0)?,
        project_id: row.get(1)?,
        alert_type: parsed_col::<AlertType>(row, 2)?,
        threshold_pct: row.get(3)?,
        usage: row.get(4)?,
        limit: row.get(5)?,
        triggered_at: ts_col(row, 6)?,
        resolved_at: opt_ts_col(row, 7)?,
        resolved: row.get(8)?,
    })
}

fn row_to_performance(row: &rusqlite::Row<'_>) -> rusqlite::Result<PerformanceRecord> {
    let latency_ms: i64 = row.get(4)?;
    let tokens_in: i64 = row.get(5)?;
    let tokens_out: i64 = row.get(6)?;
    Ok(PerformanceRecord {
        id: uuid_col(row, 0)?,
        model_key: row.get(1)?,
        task_type: parsed_col::<TaskType>(row, 2)?,
        project_id: row.get(3)?,
        latency_ms: latency_ms.max(0) as u64,
        tokens_in: tokens_in.max(0) as u64,
        tokens_out: tokens_out.max(0) as u64,
        success: row.get(7)?,
        cost: row.get(8)?,
        task_id: row.get(9)?,
        session_id: row.get(10)?,
        error: row.get(11)?,
        created_at: ts_col(row, 12)?,
    })
}

fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let hit_count: i64 = row.get(2)?;
    Ok(CacheEntry {
        key: row.get(0)?,
        response: row.get(1)?,
        hit_count: hit_count.max(0) as u64,
        expires_at: ts_col(row, 3)?,
        last_accessed: ts_col(row, 4)?,
    })
}
