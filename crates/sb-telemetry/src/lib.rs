//! Observability for the switchboard gateway.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Spans**: per-request spans carrying a trace id for log correlation
//! - **Metrics**: an injectable collector with Prometheus and JSON export

pub mod logging;
pub mod metrics;
pub mod spans;
