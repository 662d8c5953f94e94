//! Target registry: the set of application nodes to monitor.
//!
//! Node addresses come from one or more descriptor documents, remote or
//! local. A refresh reloads every source concurrently; a source that fails
//! keeps contributing its previous result.

use futures::future::join_all;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::clients::{ClientError, HttpFetcher};

/// Delay between attempts until the first successful load.
pub const INITIAL_RETRY: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed fetching '{source_url}': {error}")]
    Fetch { source_url: String, error: ClientError },
    #[error("failed reading '{path}': {error}")]
    Read { path: String, error: std::io::Error },
    #[error("malformed descriptor '{source_url}': {error}")]
    Malformed { source_url: String, error: serde_json::Error },
    #[error("no descriptor source could be loaded")]
    NothingLoaded,
}

/// A descriptor entry: a bare address or an object carrying one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DescriptorEntry {
    Address(String),
    Object { address: String },
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    targets: Vec<DescriptorEntry>,
}

/// Parse a descriptor document into node addresses. Any malformed entry
/// rejects the whole document.
pub fn parse_descriptor(text: &str) -> Result<Vec<String>, serde_json::Error> {
    let descriptor: Descriptor = serde_json::from_str(text)?;
    Ok(descriptor
        .targets
        .into_iter()
        .map(|entry| match entry {
            DescriptorEntry::Address(address) | DescriptorEntry::Object { address } => address,
        })
        .collect())
}

pub struct TargetRegistry {
    sources: Vec<String>,
    http: HttpFetcher,
    nodes: RwLock<Option<Arc<Vec<String>>>>,
    last_results: Mutex<HashMap<String, Vec<String>>>,
}

impl TargetRegistry {
    pub fn new(sources: Vec<String>, http: HttpFetcher) -> Self {
        Self {
            sources,
            http,
            nodes: RwLock::new(None),
            last_results: Mutex::new(HashMap::new()),
        }
    }

    /// Current node addresses; empty until the first successful refresh.
    pub fn nodes(&self) -> Arc<Vec<String>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Replace the node set in one step.
    pub(crate) fn publish(&self, nodes: Vec<String>) {
        *self.nodes.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(nodes));
    }

    async fn load_source(&self, source: &str) -> Result<Vec<String>, RegistryError> {
        let text = if source.starts_with("http://") || source.starts_with("https://") {
            self.http.fetch_text(source).await.map_err(|error| RegistryError::Fetch {
                source_url: source.to_string(),
                error,
            })?
        } else {
            tokio::fs::read_to_string(source)
                .await
                .map_err(|error| RegistryError::Read {
                    path: source.to_string(),
                    error,
                })?
        };
        parse_descriptor(&text).map_err(|error| RegistryError::Malformed {
            source_url: source.to_string(),
            error,
        })
    }

    /// Reload every source and publish the merged, deduplicated node set.
    /// Returns the number of nodes.
    pub async fn refresh(&self) -> Result<usize, RegistryError> {
        let results = join_all(self.sources.iter().map(|source| self.load_source(source))).await;

        let merged = {
            let mut last_results = self.last_results.lock().unwrap_or_else(|e| e.into_inner());
            for (source, result) in self.sources.iter().zip(results) {
                match result {
                    Ok(nodes) => {
                        last_results.insert(source.clone(), nodes);
                    }
                    Err(e) => tracing::warn!("Registry: {}", e),
                }
            }

            let mut seen = HashSet::new();
            let mut merged = Vec::new();
            for source in &self.sources {
                for address in last_results.get(source).into_iter().flatten() {
                    if seen.insert(address.clone()) {
                        merged.push(address.clone());
                    }
                }
            }
            if last_results.is_empty() {
                return Err(RegistryError::NothingLoaded);
            }
            merged
        };

        let count = merged.len();
        self.publish(merged);
        Ok(count)
    }

    /// Retry until a first refresh succeeds or `stop` fires. Returns false
    /// when stopped first.
    pub async fn wait_until_loaded(&self, retry: Duration, stop: &mut broadcast::Receiver<()>) -> bool {
        loop {
            match self.refresh().await {
                Ok(count) => {
                    tracing::info!("Registry: Loaded {} nodes", count);
                    return true;
                }
                Err(e) => tracing::warn!("Registry: Initial load failed, retrying in {:?}: {}", retry, e),
            }
            tokio::select! {
                _ = stop.recv() => return false,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Refresh every `every` until stopped. The first tick is skipped since
    /// the registry was just loaded.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        every: Duration,
        mut stop: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => match self.refresh().await {
                        Ok(count) => tracing::debug!("Registry: Refreshed, {} nodes", count),
                        Err(e) => tracing::warn!("Registry: Refresh failed: {}", e),
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::{http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::NamedTempFile;
    use tokio_test::assert_ok;

    fn http() -> HttpFetcher {
        HttpFetcher::new(None, Duration::from_secs(5)).unwrap()
    }

    fn descriptor_file(text: &str) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), text).unwrap();
        file
    }

    #[test]
    fn test_parse_descriptor() {
        let nodes = parse_descriptor(r#"{"targets": ["a.eth", {"address": "b.sol", "title": "B"}]}"#).unwrap();
        assert_eq!(nodes, vec!["a.eth", "b.sol"]);
        assert!(parse_descriptor(r#"{"targets": [1]}"#).is_err());
        assert!(parse_descriptor(r#"{"subplebbits": []}"#).is_err());
    }

    #[tokio::test]
    async fn test_merge_dedupes_first_seen() {
        let first = descriptor_file(r#"{"targets": ["a.eth", "b.eth"]}"#);
        let second = descriptor_file(r#"{"targets": ["b.eth", "c.eth"]}"#);
        let registry = TargetRegistry::new(
            vec![
                first.path().display().to_string(),
                second.path().display().to_string(),
            ],
            http(),
        );
        assert!(!registry.is_loaded());

        assert_eq!(registry.refresh().await.unwrap(), 3);
        assert_eq!(*registry.nodes(), vec!["a.eth", "b.eth", "c.eth"]);
    }

    #[tokio::test]
    async fn test_failed_source_keeps_previous_result() {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        let app = Router::new().route(
            "/list.json",
            get(move || {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        (StatusCode::OK, r#"{"targets": ["remote.eth"]}"#.to_string())
                    } else {
                        (StatusCode::BAD_GATEWAY, "down".to_string())
                    }
                }
            }),
        );
        let base = serve(app).await;
        let local = descriptor_file(r#"{"targets": ["local.eth"]}"#);
        let registry = TargetRegistry::new(
            vec![format!("{}/list.json", base), local.path().display().to_string()],
            http(),
        );

        assert_ok!(registry.refresh().await);
        healthy.store(false, Ordering::SeqCst);
        assert_ok!(registry.refresh().await);
        assert_eq!(*registry.nodes(), vec!["remote.eth", "local.eth"]);
    }

    #[tokio::test]
    async fn test_nothing_loaded_is_error() {
        let broken = descriptor_file("not json");
        let registry = TargetRegistry::new(
            vec![
                broken.path().display().to_string(),
                "/nonexistent/contrail/targets.json".to_string(),
            ],
            http(),
        );
        assert!(matches!(registry.refresh().await, Err(RegistryError::NothingLoaded)));
        assert!(registry.nodes().is_empty());

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        stop_tx.send(()).unwrap();
        assert!(!registry.wait_until_loaded(Duration::from_secs(60), &mut stop_rx).await);
    }
}
