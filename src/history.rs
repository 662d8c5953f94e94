//! History snapshots of the externally visible state.
//!
//! A snapshot of the state view is stored every minute as an immutable,
//! timestamp-keyed row. The most recent rows are kept in memory so that the
//! common "last few hours" queries never touch the database.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::{DbError, HistoryRecord, Store};
use crate::state::{Category, StateStore};

/// Number of recent snapshots held in memory.
pub const CACHE_CAPACITY: usize = 500;

/// Largest number of points a single query may return.
pub const MAX_RESULTS: usize = 500;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(
        "query matches {count} snapshots, more than the maximum of {max}; \
         use a shorter time range or a larger interval"
    )]
    TooManyResults { count: usize, max: usize },
    #[error("invalid time '{0}': expected unix seconds, RFC 3339, 'now' or a relative time like '-6h'")]
    BadTime(String),
    #[error("'from' must not be after 'to'")]
    BadRange,
}

/// Parse an absolute or relative time. Relative times are negative offsets
/// from `now` in seconds, minutes, hours or days (`-45s`, `-30m`, `-6h`,
/// `-2d`).
pub fn parse_time(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, HistoryError> {
    let bad = || HistoryError::BadTime(value.to_string());
    let value_trimmed = value.trim();

    if value_trimmed.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Some(relative) = value_trimmed.strip_prefix('-') {
        let (unit_start, _) = relative.char_indices().last().ok_or_else(bad)?;
        let (amount, unit) = relative.split_at(unit_start);
        let amount: i64 = amount.parse().map_err(|_| bad())?;
        let offset = match unit {
            "s" => ChronoDuration::try_seconds(amount),
            "m" => ChronoDuration::try_minutes(amount),
            "h" => ChronoDuration::try_hours(amount),
            "d" => ChronoDuration::try_days(amount),
            _ => None,
        }
        .ok_or_else(bad)?;
        return now.checked_sub_signed(offset).ok_or_else(bad);
    }
    if value_trimmed.chars().all(|c| c.is_ascii_digit()) {
        let seconds: i64 = value_trimmed.parse().map_err(|_| bad())?;
        return Utc.timestamp_opt(seconds, 0).single().ok_or_else(bad);
    }
    DateTime::parse_from_rfc3339(value_trimmed)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| bad())
}

/// A range query over stored snapshots.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Minimum spacing between returned points
    pub interval: Option<ChronoDuration>,
    /// Keep only these targets' records
    pub filters: Vec<(Category, String)>,
    /// Keep these top-level sections whole
    pub include: Vec<String>,
    pub max_results: usize,
}

impl HistoryQuery {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            interval: None,
            filters: vec![],
            include: vec![],
            max_results: MAX_RESULTS,
        }
    }
}

/// Captures snapshots and answers range queries.
pub struct HistorySnapshotter {
    store: Arc<Store>,
    state: Arc<StateStore>,
    cache: RwLock<VecDeque<HistoryRecord>>,
    capacity: usize,
}

impl HistorySnapshotter {
    pub fn new(store: Arc<Store>, state: Arc<StateStore>) -> Self {
        Self {
            store,
            state,
            cache: RwLock::new(VecDeque::new()),
            capacity: CACHE_CAPACITY,
        }
    }

    pub fn capture(&self) -> Result<(), DbError> {
        self.capture_at(Utc::now())
    }

    /// Store the current state view as the snapshot for `time`.
    pub fn capture_at(&self, time: DateTime<Utc>) -> Result<(), DbError> {
        let snapshot = self.state.view(&[]);
        self.store.add_history(time, &snapshot)?;

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.push_back(HistoryRecord { time, snapshot });
        while cache.len() > self.capacity {
            cache.pop_front();
        }
        Ok(())
    }

    /// Reload the cache from the most recent stored snapshots.
    pub fn refresh_cache(&self) -> Result<usize, DbError> {
        let records = self.store.get_recent_history(self.capacity)?;
        let count = records.len();
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = records.into();
        Ok(count)
    }

    /// Downsampled records in range, from the cache when it reaches back far
    /// enough. The store path sizes the result from the keys alone and only
    /// reads the snapshots that are returned.
    fn select(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, HistoryError> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            let covered = cache.len() < self.capacity || cache.front().is_some_and(|first| first.time <= query.from);
            if covered {
                let in_range = cache.iter().filter(|r| r.time >= query.from && r.time <= query.to);
                let kept = downsample(in_range, |r| r.time, query.interval);
                check_count(kept.len(), query.max_results)?;
                return Ok(kept.into_iter().cloned().collect());
            }
        }
        let times = self.store.get_history_times(query.from, query.to)?;
        let kept = downsample(times, |t| *t, query.interval);
        check_count(kept.len(), query.max_results)?;
        Ok(self.store.get_history_at(&kept)?)
    }

    /// `[unix seconds, snapshot]` pairs in time order.
    pub fn query(&self, query: &HistoryQuery) -> Result<Vec<(i64, Value)>, HistoryError> {
        if query.from > query.to {
            return Err(HistoryError::BadRange);
        }
        Ok(self
            .select(query)?
            .into_iter()
            .map(|r| (r.time.timestamp(), filter_snapshot(&r.snapshot, &query.include, &query.filters)))
            .collect())
    }

    /// Capture and cache refresh loops.
    pub fn spawn_loops(
        self: Arc<Self>,
        capture_every: Duration,
        cache_every: Duration,
        mut stop: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut capture = tokio::time::interval(capture_every);
            capture.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cache = tokio::time::interval(cache_every);
            cache.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = capture.tick() => {
                        if let Err(e) = self.capture() {
                            tracing::error!("Failed to store history snapshot: {}", e);
                        }
                    }
                    _ = cache.tick() => match self.refresh_cache() {
                        Ok(count) => tracing::debug!("History cache holds {} snapshots", count),
                        Err(e) => tracing::error!("Failed to refresh history cache: {}", e),
                    },
                }
            }
        })
    }
}

fn check_count(count: usize, max: usize) -> Result<(), HistoryError> {
    if count > max {
        return Err(HistoryError::TooManyResults { count, max });
    }
    Ok(())
}

/// Keep the first item, then only items at least `interval` after the
/// previously kept one.
fn downsample<T>(
    items: impl IntoIterator<Item = T>,
    time: impl Fn(&T) -> DateTime<Utc>,
    interval: Option<ChronoDuration>,
) -> Vec<T> {
    let Some(interval) = interval else {
        return items.into_iter().collect();
    };
    let mut last: Option<DateTime<Utc>> = None;
    items
        .into_iter()
        .filter(|item| {
            let t = time(item);
            let keep = last.map_or(true, |l| t - l >= interval);
            if keep {
                last = Some(t);
            }
            keep
        })
        .collect()
}

/// Narrow a snapshot to the `filters` targets, then drop every top-level
/// section not named in `include`. Without either the snapshot is returned
/// as is.
pub fn filter_snapshot(snapshot: &Value, include: &[String], filters: &[(Category, String)]) -> Value {
    let Some(sections) = snapshot.as_object() else {
        return snapshot.clone();
    };

    let mut out = if filters.is_empty() {
        sections.clone()
    } else {
        let mut out = Map::new();
        for (category, target) in filters {
            let record = sections.get(category.as_str()).and_then(|s| s.get(target));
            let section = out
                .entry(category.as_str())
                .or_insert_with(|| Value::Object(Map::new()));
            if let (Value::Object(section), Some(record)) = (section, record) {
                section.insert(target.clone(), record.clone());
            }
        }
        out
    };
    if !include.is_empty() {
        out.retain(|name, _| include.contains(name));
    }
    Value::Object(out)
}
