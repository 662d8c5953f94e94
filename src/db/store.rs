//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Keys bound per `IN (...)` lookup.
const HISTORY_BATCH: usize = 200;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        let migrations = [
            include_str!("../../migrations/000001_init.up.sql"),
            include_str!("../../migrations/000002_outcome_index.up.sql"),
        ];
        for (i, sql) in migrations.iter().enumerate() {
            conn.execute_batch(sql)
                .map_err(|e| DbError::Migration(format!("Migration {} failed: {}", i + 1, e)))?;
        }
        Ok(())
    }

    // --- Current state ---

    /// Load the persisted state document, if one was ever saved.
    pub fn load_state(&self) -> Result<Option<serde_json::Value>, DbError> {
        let conn = self.conn()?;
        let text: Option<String> = conn
            .query_row("SELECT document FROM health_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Replace the persisted state document.
    pub fn save_state(&self, document: &serde_json::Value) -> Result<(), DbError> {
        let text = serde_json::to_string(document)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO health_state (id, document, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET document=excluded.document, updated_at=excluded.updated_at",
            params![text, Utc::now().format(TIME_FORMAT).to_string()],
        )?;
        Ok(())
    }

    // --- History snapshots ---

    /// Write an immutable snapshot. A second write for the same timestamp is ignored.
    pub fn add_history(&self, time: DateTime<Utc>, snapshot: &serde_json::Value) -> Result<(), DbError> {
        let text = serde_json::to_string(snapshot)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO history (time, snapshot) VALUES (?1, ?2)",
            params![history_key(time), text],
        )?;
        Ok(())
    }

    /// Timestamps of the snapshots with `from <= time <= to`, oldest first.
    /// Only the keys are read so a range can be sized before any snapshot is.
    pub fn get_history_times(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT time FROM history WHERE time >= ?1 AND time <= ?2 ORDER BY time ASC")?;
        let keys = stmt
            .query_map(params![history_key(from), history_key(to)], |row| row.get::<_, String>(0))?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(keys.iter().filter_map(|key| parse_db_time(key)).collect())
    }

    /// The snapshots stored at exactly `times`, oldest first. Missing keys are skipped.
    pub fn get_history_at(&self, times: &[DateTime<Utc>]) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn()?;
        let mut rows = Vec::with_capacity(times.len());
        for chunk in times.chunks(HISTORY_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT time, snapshot FROM history WHERE time IN ({}) ORDER BY time ASC",
                placeholders
            ))?;
            let batch = stmt
                .query_map(params_from_iter(chunk.iter().map(|t| history_key(*t))), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            rows.extend(batch);
        }
        drop(conn);

        Ok(rows.into_iter().filter_map(|(time, text)| decode_history(&time, &text)).collect())
    }

    /// The `limit` most recent snapshots, oldest first.
    pub fn get_recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT time, snapshot FROM history ORDER BY time DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        let mut records: Vec<_> = rows
            .into_iter()
            .filter_map(|(time, text)| decode_history(&time, &text))
            .collect();
        records.reverse();
        Ok(records)
    }

    // --- Outcome log ---

    /// Add outcomes in batch.
    pub fn add_outcomes(&self, outcomes: &[OutcomeRecord]) -> Result<(), DbError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO outcomes (time, kind, target, success, latency, attempts) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for o in outcomes {
                stmt.execute(params![
                    o.time.format(TIME_FORMAT).to_string(),
                    o.kind,
                    o.target,
                    o.success,
                    o.latency,
                    o.attempts,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Outcomes of one probe kind against one target since `since`, oldest first.
    pub fn get_outcomes(
        &self,
        kind: &str,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, kind, target, success, latency, attempts FROM outcomes
             WHERE target = ?1 AND kind = ?2 AND time >= ?3 ORDER BY time ASC",
        )?;

        let outcomes = stmt
            .query_map(params![target, kind, since.format(TIME_FORMAT).to_string()], |row| {
                let time_str: String = row.get(0)?;
                Ok(OutcomeRecord {
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    kind: row.get(1)?,
                    target: row.get(2)?,
                    success: row.get(3)?,
                    latency: row.get(4)?,
                    attempts: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(outcomes)
    }

    /// Delete outcomes before a cutoff, returning how many were removed.
    pub fn delete_outcomes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM outcomes WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }
}

/// Snapshot key: RFC 3339 with millisecond precision, which sorts by time.
fn history_key(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_history(time: &str, text: &str) -> Option<HistoryRecord> {
    let time = parse_db_time(time)?;
    match serde_json::from_str(text) {
        Ok(snapshot) => Some(HistoryRecord { time, snapshot }),
        Err(e) => {
            tracing::warn!("Skipping unreadable history snapshot {}: {}", time, e);
            None
        }
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn outcome(time: DateTime<Utc>, target: &str, success: bool, latency: Option<f64>) -> OutcomeRecord {
        OutcomeRecord {
            time,
            kind: "contentFetch".to_string(),
            target: target.to_string(),
            success,
            latency,
            attempts: 1,
        }
    }

    #[test]
    fn test_state_document_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.load_state().unwrap().is_none());

        store.save_state(&json!({"version": 1})).unwrap();
        store.save_state(&json!({"version": 2})).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(json!({"version": 2})));
    }

    #[test]
    fn test_reopen_existing_database() {
        let tmp = NamedTempFile::new().unwrap();
        Store::new(tmp.path()).unwrap().save_state(&json!({"a": 1})).unwrap();
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_history_is_immutable_and_ordered() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t0 = Utc::now();

        store.add_history(t0 + Duration::minutes(1), &json!({"n": 1})).unwrap();
        store.add_history(t0, &json!({"n": 0})).unwrap();
        store.add_history(t0, &json!({"n": 99})).unwrap();

        let times = store.get_history_times(t0 - Duration::hours(1), t0 + Duration::hours(1)).unwrap();
        assert_eq!(times.len(), 2);
        let all = store.get_history_at(&times).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].snapshot, json!({"n": 0}));
        assert_eq!(all[1].snapshot, json!({"n": 1}));

        let recent = store.get_recent_history(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].snapshot, json!({"n": 1}));
    }

    #[test]
    fn test_history_lookup_by_key() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t0 = Utc::now();
        let times: Vec<_> = (0..450).map(|i| t0 + Duration::seconds(i)).collect();
        for (i, t) in times.iter().enumerate() {
            store.add_history(*t, &json!({"n": i})).unwrap();
        }

        // spans several batches and skips keys that were never written
        let wanted: Vec<_> = times.iter().step_by(2).copied().chain([t0 - Duration::hours(1)]).collect();
        let records = store.get_history_at(&wanted).unwrap();
        assert_eq!(records.len(), 225);
        assert_eq!(records[0].snapshot, json!({"n": 0}));
        assert_eq!(records[224].snapshot, json!({"n": 448}));
        assert!(store.get_history_at(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_outcome_log() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();

        store
            .add_outcomes(&[
                outcome(now - Duration::days(8), "gateways:a", true, Some(1.0)),
                outcome(now - Duration::hours(2), "gateways:a", false, None),
                outcome(now - Duration::minutes(5), "gateways:a", true, Some(0.5)),
                outcome(now, "gateways:b", true, Some(0.1)),
            ])
            .unwrap();

        let recent = store.get_outcomes("contentFetch", "gateways:a", now - Duration::hours(1)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].latency, Some(0.5));

        let deleted = store.delete_outcomes_before(now - Duration::days(7)).unwrap();
        assert_eq!(deleted, 1);
        let left = store.get_outcomes("contentFetch", "gateways:a", now - Duration::days(30)).unwrap();
        assert_eq!(left.len(), 2);
        assert!(!left[0].success);
        assert_eq!(left[0].latency, None);
    }
}
