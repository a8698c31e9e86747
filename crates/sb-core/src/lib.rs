//! Shared foundation for the switchboard gateway: the routing data model,
//! TOML configuration, an injectable clock and the SQLite ledger store.

pub mod clock;
pub mod config;
pub mod store;
pub mod types;
