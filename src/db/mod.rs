//! Database module for Contrail.
//!
//! Provides SQLite storage for the current state document, history snapshots
//! and the per-run outcome log.

mod models;
mod store;

pub use models::*;
pub use store::*;
