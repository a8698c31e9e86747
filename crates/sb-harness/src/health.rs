use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sb_core::types::{HealthStatus, ModelHealth};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before a model is marked degraded.
    pub degraded_after: u32,
    /// Consecutive failures before a model is marked down.
    pub down_after: u32,
    /// How long a down model sits out of selection before it may be retried.
    pub recheck_after: Duration,
    /// Successful calls slower than this still mark the model degraded.
    pub slow_call_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            down_after: 5,
            recheck_after: Duration::seconds(60),
            slow_call_ms: 20_000,
        }
    }
}

// ---------------------------------------------------------------------------
// HealthTracker
// ---------------------------------------------------------------------------

/// Heuristic per-model health, updated after every dispatch.
///
/// Unlike a circuit breaker this never rejects a call. It only answers
/// [`HealthTracker::is_selectable`], which the selector consults when deciding
/// which catalog entries count as available. A down model becomes selectable
/// again once `recheck_after` has passed since its last dispatch, so the next
/// routed request acts as the probe.
#[derive(Debug, Default)]
pub struct HealthTracker {
    config: HealthConfig,
    models: DashMap<String, ModelHealth>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
        }
    }

    pub fn record_success(&self, model_key: &str, latency_ms: u64, at: DateTime<Utc>) -> HealthStatus {
        let mut entry = self
            .models
            .entry(model_key.to_string())
            .or_insert_with(|| ModelHealth::unknown(model_key));

        let previous = entry.status;
        entry.consecutive_failures = 0;
        entry.last_check = Some(at);
        entry.last_latency_ms = Some(latency_ms);
        entry.status = if latency_ms > self.config.slow_call_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if previous != entry.status {
            match entry.status {
                HealthStatus::Degraded => {
                    warn!(model = model_key, latency_ms, "model slow, marked degraded")
                }
                _ if matches!(previous, HealthStatus::Degraded | HealthStatus::Down) => {
                    info!(model = model_key, from = ?previous, "model recovered")
                }
                _ => {}
            }
        }
        entry.status
    }

    pub fn record_failure(
        &self,
        model_key: &str,
        latency_ms: Option<u64>,
        at: DateTime<Utc>,
    ) -> HealthStatus {
        let mut entry = self
            .models
            .entry(model_key.to_string())
            .or_insert_with(|| ModelHealth::unknown(model_key));

        let previous = entry.status;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_check = Some(at);
        if latency_ms.is_some() {
            entry.last_latency_ms = latency_ms;
        }

        let failures = entry.consecutive_failures;
        entry.status = if failures >= self.config.down_after {
            HealthStatus::Down
        } else if failures >= self.config.degraded_after {
            HealthStatus::Degraded
        } else {
            // below threshold: keep whatever we knew
            previous
        };

        if previous != entry.status {
            warn!(
                model = model_key,
                failures,
                from = ?previous,
                to = ?entry.status,
                "model health changed"
            );
        }
        entry.status
    }

    pub fn health(&self, model_key: &str) -> ModelHealth {
        self.models
            .get(model_key)
            .map(|h| h.clone())
            .unwrap_or_else(|| ModelHealth::unknown(model_key))
    }

    /// Whether the selector may consider this model right now.
    pub fn is_selectable(&self, model_key: &str, now: DateTime<Utc>) -> bool {
        let Some(h) = self.models.get(model_key) else {
            return true;
        };
        match (h.status, h.last_check) {
            (HealthStatus::Down, Some(last)) => now - last >= self.config.recheck_after,
            _ => true,
        }
    }

    /// All tracked models, sorted by key.
    pub fn snapshot(&self) -> Vec<ModelHealth> {
        let mut all: Vec<ModelHealth> = self.models.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.model_key.cmp(&b.model_key));
        all
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
