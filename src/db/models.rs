//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single probe run, as kept in the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub time: DateTime<Utc>,
    /// Probe kind name, e.g. "contentFetch"
    pub kind: String,
    /// Rendered state key of the target
    pub target: String,
    pub success: bool,
    /// Latency in seconds, absent on failure
    pub latency: Option<f64>,
    pub attempts: u32,
}

/// A stored history snapshot.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub time: DateTime<Utc>,
    pub snapshot: serde_json::Value,
}
