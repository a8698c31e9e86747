use std::sync::Arc;

use sb_core::store::{PerformanceStore, StoreError};
use sb_core::types::{PerformanceRecord, TaskType};
use tracing::warn;

/// Neutral score for a (model, task) pair with no usable history.
pub const COLD_START_PRIOR: f64 = 0.5;

/// Latency at or beyond which the speed component bottoms out.
const SLOW_LATENCY_MS: f64 = 30_000.0;
const SUCCESS_WEIGHT: f64 = 0.7;
const SPEED_WEIGHT: f64 = 0.3;

/// Append-only outcome log with rolling per-(model, task) scores.
pub struct PerformanceLedger {
    store: Option<Arc<dyn PerformanceStore>>,
    window: usize,
}

impl PerformanceLedger {
    pub fn new(store: Option<Arc<dyn PerformanceStore>>, window: usize) -> Self {
        Self {
            store,
            window: window.max(1),
        }
    }

    pub async fn record(&self, record: &PerformanceRecord) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => store.append_performance(record).await,
            None => Ok(()),
        }
    }

    /// Rolling score in [0, 1] over the most recent `window` outcomes.
    pub async fn score(&self, model_key: &str, task_type: TaskType) -> f64 {
        let Some(store) = &self.store else {
            return COLD_START_PRIOR;
        };
        match store.recent_performance(model_key, task_type, self.window).await {
            Ok(records) => score_records(&records),
            Err(e) => {
                warn!(model = model_key, error = %e, "performance history unavailable");
                COLD_START_PRIOR
            }
        }
    }
}

/// `0.7 * success_rate + 0.3 * speed`, where speed is
/// `1 - avg_latency / 30s` over successful calls only.
pub fn score_records(records: &[PerformanceRecord]) -> f64 {
    if records.is_empty() {
        return COLD_START_PRIOR;
    }
    let successes: Vec<&PerformanceRecord> = records.iter().filter(|r| r.success).collect();
    let success_rate = successes.len() as f64 / records.len() as f64;
    let speed = if successes.is_empty() {
        0.0
    } else {
        let avg = successes.iter().map(|r| r.latency_ms as f64).sum::<f64>() / successes.len() as f64;
        1.0 - (avg / SLOW_LATENCY_MS).min(1.0)
    };
    (SUCCESS_WEIGHT * success_rate + SPEED_WEIGHT * speed).clamp(0.0, 1.0)
}
