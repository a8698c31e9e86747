//! Request routing for the switchboard gateway.
//!
//! A [`RequestRouter`] classifies a prompt, scores the model catalog, consults
//! the response cache and the budget ledger, dispatches to a backend, and
//! hands ledger writes to a background worker. See [`router`] for the flow.

pub mod adapters;
pub mod budget;
pub mod catalog;
pub mod classifier;
pub mod dispatcher;
pub mod llm;
pub mod performance;
pub mod pricing;
pub mod response_cache;
pub mod router;
pub mod selector;
pub mod writer;

pub use router::{Generated, GenerateFailure, RequestMetrics, RequestRouter, RouterBuilder};
pub use selector::{Selection, SelectionSource};
