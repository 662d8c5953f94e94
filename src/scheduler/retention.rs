//! Retention manager for pruning the outcome log.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long per-run outcomes are kept for reliability stats.
pub const OUTCOME_RETENTION_DAYS: i64 = 7;

const PRUNE_EVERY: Duration = Duration::from_secs(10 * 60);

/// Manager for deleting outcomes past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(PRUNE_EVERY);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                "RetentionManager: Keeping outcomes for {} days, pruning every {:?}",
                OUTCOME_RETENTION_DAYS,
                PRUNE_EVERY
            );

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store) -> usize {
    let cutoff = Utc::now() - ChronoDuration::days(OUTCOME_RETENTION_DAYS);
    match store.delete_outcomes_before(cutoff) {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!("RetentionManager: Deleted {} outcomes before {}", deleted, cutoff);
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete old outcomes: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OutcomeRecord;
    use tempfile::NamedTempFile;

    fn outcome(days_ago: i64) -> OutcomeRecord {
        OutcomeRecord {
            time: Utc::now() - ChronoDuration::days(days_ago),
            kind: "contentFetch".to_string(),
            target: "gateways:a".to_string(),
            success: true,
            latency: Some(1.0),
            attempts: 1,
        }
    }

    #[test]
    fn test_prunes_only_expired_outcomes() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.add_outcomes(&[outcome(10), outcome(8), outcome(1)]).unwrap();

        assert_eq!(process_retention(&store), 2);
        assert_eq!(process_retention(&store), 0);

        let left = store
            .get_outcomes("contentFetch", "gateways:a", Utc::now() - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(left.len(), 1);
    }
}
