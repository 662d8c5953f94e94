//! Reliability statistics over the outcome log.
//!
//! Windows are computed on demand from stored per-run outcomes rather than
//! kept as running aggregates, so restarts and clock skew never accumulate.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tdigests::TDigest;

use crate::db::{DbError, OutcomeRecord, Store};

/// Default lookback windows in hours.
pub const DEFAULT_WINDOWS: [u32; 3] = [1, 6, 24];

const DIGEST_COMPRESSION: usize = 100;

/// Aggregates for one target over one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityStats {
    pub hours: u32,
    pub run_count: usize,
    pub success_count: usize,
    /// Successes over total runs, 0 without runs
    pub success_rate: f64,
    /// Mean latency of successful runs, seconds
    pub mean_latency: f64,
    /// Positional median of successful latencies (`sorted[n / 2]`)
    pub median_latency: f64,
    /// Mean attempt count of successful runs
    pub mean_attempts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_latency: Option<f64>,
}

/// Compute stats from the outcomes of one window.
pub fn aggregate(hours: u32, outcomes: &[OutcomeRecord]) -> ReliabilityStats {
    let successes: Vec<&OutcomeRecord> = outcomes.iter().filter(|o| o.success).collect();
    let mut latencies: Vec<f64> = successes.iter().filter_map(|o| o.latency).collect();
    latencies.sort_by(f64::total_cmp);

    let run_count = outcomes.len();
    let success_count = successes.len();
    let success_rate = if run_count == 0 {
        0.0
    } else {
        success_count as f64 / run_count as f64
    };

    let mean_latency = mean(&latencies);
    let median_latency = latencies.get(latencies.len() / 2).copied().unwrap_or(0.0);
    let attempts: Vec<f64> = successes.iter().map(|o| o.attempts as f64).collect();

    let (p90_latency, p99_latency) = if latencies.is_empty() {
        (None, None)
    } else {
        let mut digest = TDigest::from_values(latencies.clone());
        digest.compress(DIGEST_COMPRESSION);
        (Some(digest.estimate_quantile(0.9)), Some(digest.estimate_quantile(0.99)))
    };

    ReliabilityStats {
        hours,
        run_count,
        success_count,
        success_rate,
        mean_latency,
        median_latency,
        mean_attempts: mean(&attempts),
        p90_latency,
        p99_latency,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Reads outcome windows from the store and aggregates them.
pub struct ReliabilityAggregator {
    store: Arc<Store>,
}

impl ReliabilityAggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Stats for `kind` runs against `target` (a rendered state key) over the
    /// last `hours`.
    pub fn window(&self, kind: &str, target: &str, hours: u32) -> Result<ReliabilityStats, DbError> {
        let since = Utc::now() - ChronoDuration::hours(hours as i64);
        let outcomes = self.store.get_outcomes(kind, target, since)?;
        Ok(aggregate(hours, &outcomes))
    }

    /// Stats for several windows, reading the outcome log once.
    pub fn windows(&self, kind: &str, target: &str, hours: &[u32]) -> Result<Vec<ReliabilityStats>, DbError> {
        let Some(longest) = hours.iter().max() else {
            return Ok(vec![]);
        };
        let now = Utc::now();
        let outcomes = self
            .store
            .get_outcomes(kind, target, now - ChronoDuration::hours(*longest as i64))?;

        Ok(hours
            .iter()
            .map(|h| {
                let since = now - ChronoDuration::hours(*h as i64);
                let window: Vec<OutcomeRecord> = outcomes.iter().filter(|o| o.time >= since).cloned().collect();
                aggregate(*h, &window)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn outcome(minutes_ago: i64, success: bool, latency: Option<f64>, attempts: u32) -> OutcomeRecord {
        OutcomeRecord {
            time: Utc::now() - ChronoDuration::minutes(minutes_ago),
            kind: "contentFetch".to_string(),
            target: "gateways:https://gw.example".to_string(),
            success,
            latency,
            attempts,
        }
    }

    #[test]
    fn test_aggregate_mixed_window() {
        let stats = aggregate(
            1,
            &[
                outcome(3, true, Some(10.0), 1),
                outcome(2, false, None, 4),
                outcome(1, true, Some(20.0), 3),
            ],
        );
        assert_eq!(stats.run_count, 3);
        assert_eq!((stats.success_rate * 100.0).round() / 100.0, 0.67);
        assert_eq!(stats.mean_latency, 15.0);
        assert_eq!(stats.median_latency, 20.0);
        assert_eq!(stats.mean_attempts, 2.0);
        assert!(stats.p90_latency.is_some());
    }

    #[test]
    fn test_aggregate_empty_and_all_failed() {
        let empty = aggregate(6, &[]);
        assert_eq!(empty.success_rate, 0.0);
        assert_eq!(empty.mean_latency, 0.0);
        assert_eq!(empty.p99_latency, None);

        let failed = aggregate(6, &[outcome(1, false, None, 4)]);
        assert_eq!(failed.run_count, 1);
        assert_eq!(failed.success_rate, 0.0);
        assert_eq!(failed.median_latency, 0.0);
        assert_eq!(failed.mean_attempts, 0.0);
    }

    #[test]
    fn test_windows_from_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store
            .add_outcomes(&[
                outcome(5 * 60, false, None, 4),
                outcome(30, true, Some(2.0), 1),
            ])
            .unwrap();

        let aggregator = ReliabilityAggregator::new(store);
        let windows = aggregator
            .windows("contentFetch", "gateways:https://gw.example", &DEFAULT_WINDOWS)
            .unwrap();
        assert_eq!(windows[0].run_count, 1);
        assert_eq!(windows[0].success_rate, 1.0);
        assert_eq!(windows[1].run_count, 2);
        assert_eq!(windows[1].success_rate, 0.5);

        let single = aggregator.window("contentFetch", "gateways:https://gw.example", 24).unwrap();
        assert_eq!(single, windows[2]);
    }
}
