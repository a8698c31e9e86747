//! Off-request-path persistence.
//!
//! The router never awaits a ledger or durable-cache write. It enqueues a
//! [`WriteJob`] and one worker task applies jobs in order. Every job carries
//! an id minted before enqueue, so retries are idempotent and persistence is
//! at-least-once. A job keeps running even if the request that produced it is
//! cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sb_core::config::WriterConfig;
use sb_core::store::StoreError;
use sb_core::types::{BudgetTransaction, CacheEntry, PerformanceRecord};
use sb_harness::shutdown::{DrainResult, ShutdownListener, ShutdownSignal};
use sb_telemetry::metrics::{MetricsCollector, WRITE_QUEUE_DROPPED_TOTAL};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetLedger;
use crate::performance::PerformanceLedger;
use crate::response_cache::{CacheTierError, ResponseCache};

#[derive(Debug)]
pub enum WriteJob {
    Usage(BudgetTransaction),
    Performance(PerformanceRecord),
    CacheStore(CacheEntry),
    /// Answered once every job enqueued before it has been applied.
    Flush(oneshot::Sender<()>),
}

impl WriteJob {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteJob::Usage(_) => "usage",
            WriteJob::Performance(_) => "performance",
            WriteJob::CacheStore(_) => "cache_store",
            WriteJob::Flush(_) => "flush",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheTierError),
    #[error("background writer has stopped")]
    Closed,
}

/// Where each job kind lands.
#[derive(Clone)]
pub struct WriteSinks {
    pub budget: Arc<BudgetLedger>,
    pub performance: Arc<PerformanceLedger>,
    pub cache: Arc<ResponseCache>,
}

impl WriteSinks {
    async fn write(&self, job: &WriteJob) -> Result<(), WriteError> {
        match job {
            WriteJob::Usage(tx) => self.budget.append(tx).await?,
            WriteJob::Performance(record) => self.performance.record(record).await?,
            WriteJob::CacheStore(entry) => self.cache.store_durable(entry).await?,
            WriteJob::Flush(_) => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BackgroundWriter
// ---------------------------------------------------------------------------

pub struct BackgroundWriter {
    tx: flume::Sender<WriteJob>,
    /// Jobs handed to a spawned sender because the queue was full.
    deferred: Arc<AtomicUsize>,
    signal: ShutdownSignal,
    metrics: Arc<MetricsCollector>,
}

impl BackgroundWriter {
    /// Start the worker. It stops when `signal` fires, after draining what
    /// is already queued, and then confirms the drain on `signal`.
    pub fn spawn(
        config: &WriterConfig,
        sinks: WriteSinks,
        signal: ShutdownSignal,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (tx, rx) = flume::bounded(config.queue_capacity.max(1));
        let deferred = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            rx,
            deferred: deferred.clone(),
            sinks,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            metrics: metrics.clone(),
        };
        tokio::spawn(worker.run(signal.listener(), signal.clone()));
        Self {
            tx,
            deferred,
            signal,
            metrics,
        }
    }

    /// Never blocks the caller. A full queue hands the job to a spawned
    /// sender instead of dropping it; shutdown waits for those senders.
    pub fn enqueue(&self, job: WriteJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(job)) => {
                debug!(job = job.kind(), "write queue full, deferring");
                let tx = self.tx.clone();
                let metrics = self.metrics.clone();
                let deferred = self.deferred.clone();
                deferred.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Err(flume::SendError(job)) = tx.send_async(job).await {
                        record_drop(&metrics, &job, "writer stopped");
                    }
                    // after the send, so a drain that sees zero finds the job queued
                    deferred.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(flume::TrySendError::Disconnected(job)) => {
                record_drop(&self.metrics, &job, "writer stopped");
            }
        }
    }

    /// Wait until everything enqueued so far has been applied.
    pub async fn flush(&self) -> Result<(), WriteError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send_async(WriteJob::Flush(done))
            .await
            .map_err(|_| WriteError::Closed)?;
        wait.await.map_err(|_| WriteError::Closed)
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Trigger shutdown and wait for the worker to drain.
    pub async fn shutdown(&self, timeout: Duration) -> DrainResult {
        self.signal.trigger();
        self.signal.wait_for_drain(1, timeout).await
    }
}

fn record_drop(metrics: &MetricsCollector, job: &WriteJob, reason: &str) {
    warn!(job = job.kind(), reason, "ledger write dropped");
    metrics.increment_counter(WRITE_QUEUE_DROPPED_TOTAL, &[("job", job.kind())]);
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    rx: flume::Receiver<WriteJob>,
    deferred: Arc<AtomicUsize>,
    sinks: WriteSinks,
    max_attempts: u32,
    backoff: Duration,
    metrics: Arc<MetricsCollector>,
}

impl Worker {
    async fn run(self, mut listener: ShutdownListener, signal: ShutdownSignal) {
        loop {
            tokio::select! {
                job = self.rx.recv_async() => match job {
                    Ok(job) => self.apply(job).await,
                    Err(_) => break,
                },
                _ = listener.triggered() => {
                    self.drain().await;
                    break;
                }
            }
        }
        signal.confirm_drained();
    }

    /// Apply everything queued, including jobs still held by deferred
    /// senders. Draining makes room, so those senders always complete.
    async fn drain(&self) {
        info!(
            queued = self.rx.len(),
            deferred = self.deferred.load(Ordering::SeqCst),
            "draining write queue"
        );
        loop {
            let waiting = self.deferred.load(Ordering::SeqCst);
            let pending: Vec<WriteJob> = self.rx.try_iter().collect();
            if pending.is_empty() && waiting == 0 {
                return;
            }
            for job in pending {
                self.apply(job).await;
            }
            if waiting > 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    async fn apply(&self, job: WriteJob) {
        if let WriteJob::Flush(done) = job {
            let _ = done.send(());
            return;
        }
        let mut attempt = 1;
        loop {
            match self.sinks.write(&job).await {
                Ok(()) => return,
                Err(e) if attempt < self.max_attempts => {
                    debug!(job = job.kind(), attempt, error = %e, "ledger write failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(job = job.kind(), attempts = attempt, error = %e, "ledger write failed");
                    record_drop(&self.metrics, &job, "retries exhausted");
                    return;
                }
            }
        }
    }
}
