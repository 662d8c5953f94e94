//! Content round trip through a gateway.

use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Probe, ProbeError, ProbeKind, ProbeOutcome, Target, FETCH_RETRIES};
use crate::clients::{ContentStore, HttpFetcher};

/// Time given to freshly added content to become discoverable.
pub const PROPAGATION_DELAY: Duration = Duration::from_secs(10);

/// Writes random content through the content API and reads it back through
/// the gateway under test.
pub struct ContentRoundTripProbe {
    store: Arc<dyn ContentStore>,
    http: HttpFetcher,
    propagation_delay: Duration,
    retries: u32,
}

impl ContentRoundTripProbe {
    pub fn new(store: Arc<dyn ContentStore>, http: HttpFetcher) -> Self {
        Self {
            store,
            http,
            propagation_delay: PROPAGATION_DELAY,
            retries: FETCH_RETRIES,
        }
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    async fn fetch_and_verify(&self, gateway: &str, cid: &str, expected_id: &str) -> (Result<Duration, ProbeError>, u32) {
        let url = format!("{}/ipfs/{}", gateway.trim_end_matches('/'), cid);
        let start = Instant::now();
        let (result, attempts) = self.http.fetch_json_retry(&url, self.retries).await;
        let result = result.map_err(ProbeError::from).and_then(|content| {
            match content.get("id").and_then(|id| id.as_str()) {
                Some(id) if id == expected_id => Ok(start.elapsed()),
                other => Err(ProbeError::Mismatch(format!(
                    "fetched content id {:?} does not match written id '{}'",
                    other, expected_id
                ))),
            }
        });
        (result, attempts)
    }
}

fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

#[async_trait]
impl Probe for ContentRoundTripProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::ContentFetch
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let id = random_string(32);
        let content = json!({
            "id": id,
            "author": {"address": random_string(40)},
            "title": random_string(20),
            "content": random_string(200),
        });

        let cid = match self.store.add(content.to_string().into_bytes()).await {
            Ok(cid) => cid,
            Err(e) => {
                return ProbeOutcome::failure(self.kind(), target, 0, format!("failed adding content: {}", e));
            }
        };
        tokio::time::sleep(self.propagation_delay).await;

        let (result, attempts) = self.fetch_and_verify(&target.id, &cid, &id).await;

        if let Err(e) = self.store.remove(&cid).await {
            tracing::debug!("Failed removing content {}: {}", cid, e);
        }

        match result {
            Ok(latency) => {
                tracing::debug!("Fetched {} from {} in {:?}", cid, target.id, latency);
                ProbeOutcome::success(self.kind(), target, latency, attempts)
            }
            Err(e) => ProbeOutcome::failure(self.kind(), target, attempts, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fakes::FakeContentStore;
    use crate::state::Category;
    use crate::testutil::serve;
    use axum::{extract::Path, extract::State, http::StatusCode, routing::get, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Blobs = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    /// Gateway serving whatever the fake store holds.
    fn gateway(blobs: Blobs) -> Router {
        Router::new()
            .route(
                "/ipfs/{cid}",
                get(|State(blobs): State<Blobs>, Path(cid): Path<String>| async move {
                    match blobs.lock().unwrap().get(&cid) {
                        Some(data) => (StatusCode::OK, String::from_utf8_lossy(data).to_string()),
                        None => (StatusCode::NOT_FOUND, "not found".to_string()),
                    }
                }),
            )
            .with_state(blobs)
    }

    fn probe(store: Arc<FakeContentStore>) -> ContentRoundTripProbe {
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        ContentRoundTripProbe::new(store, http).with_propagation_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_round_trip_success() {
        let store = Arc::new(FakeContentStore::default());
        let base = serve(gateway(store.blobs.clone())).await;
        let target = Target::new(Category::Gateway, base);

        let outcome = probe(store.clone()).run(&target).await;
        assert!(outcome.success, "{:?}", outcome.reason);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.latency.unwrap() > 0.0);
        assert_eq!(store.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_content_fails() {
        let store = Arc::new(FakeContentStore::default());
        let app = Router::new().route("/ipfs/{cid}", get(|| async { r#"{"id":"someone else"}"# }));
        let base = serve(app).await;
        let target = Target::new(Category::Gateway, base);

        let outcome = probe(store.clone()).run(&target).await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("does not match"));
        assert_eq!(store.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_still_cleans_up() {
        let store = Arc::new(FakeContentStore::default());
        let app = Router::new().route("/ipfs/{cid}", get(|| async { (StatusCode::GATEWAY_TIMEOUT, "slow") }));
        let base = serve(app).await;
        let target = Target::new(Category::Gateway, base);

        let outcome = probe(store.clone()).run(&target).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, FETCH_RETRIES + 1);
        assert_eq!(outcome.fields()["lastFetchTime"], 0.0);
        assert_eq!(store.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_failure_reported() {
        let store = Arc::new(FakeContentStore {
            fail_add: true,
            ..Default::default()
        });
        let target = Target::new(Category::Gateway, "http://127.0.0.1:9");

        let outcome = probe(store.clone()).run(&target).await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("failed adding content"));
        assert!(store.removed.lock().unwrap().is_empty());
    }
}
