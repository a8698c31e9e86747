use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Process-wide stop flag plus a drain counter.
///
/// Background workers hold a [`ShutdownListener`], finish whatever they have
/// queued once it fires, then call [`ShutdownSignal::confirm_drained`]. The
/// daemon triggers the signal on ctrl-c and waits for the expected number of
/// confirmations before exiting.
///
/// Built on `watch` rather than `broadcast` so a listener created after the
/// trigger still observes it.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    stop: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            stop: Arc::new(stop),
            drained: Arc::new(drained),
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.stop.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.stop.borrow()
    }

    /// Idempotent; only the first call logs.
    pub fn trigger(&self) {
        let first = self.stop.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            info!("shutdown triggered");
        }
    }

    pub fn confirm_drained(&self) {
        self.drained.send_modify(|n| *n += 1);
    }

    /// Wait until `expected` workers have confirmed, or `timeout` passes.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let done = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= expected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        let confirmed = *self.drained.borrow();
        match done {
            true => {
                info!(confirmed, "workers drained");
                DrainResult::Complete(confirmed)
            }
            false => {
                warn!(confirmed, expected, "drain timed out");
                DrainResult::TimedOut { confirmed, expected }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to each background worker.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown is triggered (immediately if it already was).
    pub async fn triggered(&mut self) {
        // Err means every signal handle is gone, which also means stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    TimedOut { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
