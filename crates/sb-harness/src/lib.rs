//! Reliability plumbing shared by the router and the daemon:
//! - advisory per-model health tracking fed by dispatch outcomes
//! - shutdown coordination so queued ledger writes drain before exit

pub mod health;
pub mod shutdown;
