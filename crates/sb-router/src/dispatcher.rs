use std::sync::Arc;
use std::time::Duration;

use sb_core::clock::SharedClock;
use sb_core::types::{ModelDescriptor, Provider};
use sb_harness::health::HealthTracker;
use sb_telemetry::metrics::{MetricsCollector, DISPATCH_DURATION_SECONDS, DISPATCH_FAILURES_TOTAL};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::llm::{BackendError, BackendRegistry};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no backend configured for provider {0}")]
    NoBackend(Provider),

    #[error("{model} timed out after {after:?}")]
    Timeout { model: String, after: Duration },

    #[error("{model}: {source}")]
    Backend {
        model: String,
        #[source]
        source: BackendError,
    },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NoBackend(_) => "no_backend",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Backend { source, .. } => source.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub text: String,
    pub latency_ms: u64,
}

/// Sends one call to the descriptor's backend under a fixed timeout.
///
/// There is no retry here. A failure is returned to the router, which records
/// it; the outcome also feeds the advisory health tracker.
pub struct Dispatcher {
    backends: Arc<BackendRegistry>,
    health: Arc<HealthTracker>,
    timeout: Duration,
    clock: SharedClock,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(
        backends: Arc<BackendRegistry>,
        health: Arc<HealthTracker>,
        timeout: Duration,
        clock: SharedClock,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            backends,
            health,
            timeout,
            clock,
            metrics,
        }
    }

    pub async fn dispatch(
        &self,
        prompt: &str,
        descriptor: &ModelDescriptor,
    ) -> Result<Dispatched, DispatchError> {
        let key = descriptor.key();
        let provider = descriptor.provider;
        let Some(backend) = self.backends.get(provider) else {
            self.fail(descriptor, None);
            return Err(DispatchError::NoBackend(provider));
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.timeout,
            backend.generate(descriptor.serving_model(), prompt),
        )
        .await;
        let elapsed = start.elapsed();
        let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.metrics
            .observe(DISPATCH_DURATION_SECONDS, elapsed.as_secs_f64());

        match outcome {
            Ok(Ok(text)) => {
                self.health.record_success(key, latency_ms, self.clock.now());
                debug!(model = key, %provider, latency_ms, "dispatch succeeded");
                Ok(Dispatched { text, latency_ms })
            }
            Ok(Err(source)) => {
                warn!(model = key, %provider, error = %source, "dispatch failed");
                self.fail(descriptor, Some(latency_ms));
                Err(DispatchError::Backend {
                    model: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(model = key, %provider, timeout = ?self.timeout, "dispatch timed out");
                self.fail(descriptor, Some(latency_ms));
                Err(DispatchError::Timeout {
                    model: key.to_string(),
                    after: self.timeout,
                })
            }
        }
    }

    fn fail(&self, descriptor: &ModelDescriptor, latency_ms: Option<u64>) {
        self.health
            .record_failure(descriptor.key(), latency_ms, self.clock.now());
        self.metrics.increment_counter(
            DISPATCH_FAILURES_TOTAL,
            &[("provider", descriptor.provider.as_str())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use chrono::{TimeZone, Utc};
    use sb_core::clock::ManualClock;
    use sb_core::types::HealthStatus;
    use sb_harness::health::HealthConfig;

    struct Fixture {
        dispatcher: Dispatcher,
        mock: Arc<MockBackend>,
        health: Arc<HealthTracker>,
        metrics: Arc<MetricsCollector>,
    }

    fn fixture(mock: MockBackend) -> Fixture {
        let mock = Arc::new(mock);
        let backends = Arc::new(BackendRegistry::new().with_backend(mock.clone()));
        let health = Arc::new(HealthTracker::new(HealthConfig::default()));
        let metrics = Arc::new(MetricsCollector::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()));
        Fixture {
            dispatcher: Dispatcher::new(
                backends,
                health.clone(),
                Duration::from_secs(30),
                clock,
                metrics.clone(),
            ),
            mock,
            health,
            metrics,
        }
    }

    #[tokio::test]
    async fn success_marks_model_healthy() {
        let f = fixture(MockBackend::new(Provider::Ollama).with_response("hi"));
        let model = ModelDescriptor::new(Provider::Ollama, "llama3.2:latest");
        let out = f.dispatcher.dispatch("hello", &model).await.unwrap();
        assert_eq!(out.text, "hi");
        assert_eq!(f.health.health("llama3.2:latest").status, HealthStatus::Healthy);
        assert_eq!(f.metrics.histogram_count(DISPATCH_DURATION_SECONDS), 1);
    }

    #[tokio::test]
    async fn adapters_dispatch_to_their_base_model() {
        let f = fixture(MockBackend::new(Provider::Ollama));
        let base = ModelDescriptor::new(Provider::Ollama, "mistral:latest");
        let adapter = ModelDescriptor::for_adapter(&base, "adapter_x", "/a/adapter_x");
        f.dispatcher.dispatch("hello", &adapter).await.unwrap();
        assert_eq!(f.mock.calls()[0].0, "mistral:latest");
        assert_eq!(
            f.health.health("mistral:latest+adapter_x").status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn backend_error_is_typed_and_counted() {
        let f = fixture(MockBackend::new(Provider::Ollama).with_error(BackendError::Api {
            status: 500,
            message: "boom".into(),
        }));
        let model = ModelDescriptor::new(Provider::Ollama, "llama3.2:latest");
        let err = f.dispatcher.dispatch("hello", &model).await.unwrap_err();
        assert_eq!(err.kind(), "api");
        assert_eq!(f.health.health("llama3.2:latest").consecutive_failures, 1);
        assert_eq!(
            f.metrics.counter(DISPATCH_FAILURES_TOTAL, &[("provider", "ollama")]),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let f = fixture(MockBackend::new(Provider::Ollama).with_delay(Duration::from_secs(31)));
        let model = ModelDescriptor::new(Provider::Ollama, "llama3.2:latest");
        let err = f.dispatcher.dispatch("hello", &model).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn missing_backend() {
        let f = fixture(MockBackend::new(Provider::Ollama));
        let model = ModelDescriptor::new(Provider::Anthropic, "claude-3-5-haiku-latest");
        let err = f.dispatcher.dispatch("hello", &model).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoBackend(Provider::Anthropic)));
    }
}
