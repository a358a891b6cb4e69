//! Database module for Heimdall.
//!
//! Provides the SQLite downtime ledger and sample journal.

mod models;
mod store;

pub use models::*;
pub use store::*;
