//! Provider discovery through content routing services.

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use super::{Probe, ProbeError, ProbeKind, ProbeOutcome, Target};
use crate::clients::{HttpFetcher, HttpProviderSource, Provider, ProviderSource};
use crate::keys;

const IP_TRACE_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";
const IP_FALLBACK_URL: &str = "https://checkip.amazonaws.com";

/// Advisory TTL of synthetic provider records, in nanoseconds (24h).
const ADVISORY_TTL_NANOS: u64 = 86_400_000_000_000;

/// How a probe combines several provider sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Try sources in order and stop at the first that answers
    FirstSuccess,
    /// Ask every source at once and merge what comes back
    FanOut,
}

/// Ask sources in order, returning the first successful answer or the last
/// error once all of them failed.
pub async fn find_first(sources: &[Arc<dyn ProviderSource>], key: &str) -> Result<Vec<Provider>, ProbeError> {
    let mut last_error = ProbeError::Lookup("no provider sources configured".to_string());
    for source in sources {
        match source.find_providers(key).await {
            Ok(providers) => return Ok(providers),
            Err(e) => {
                tracing::debug!("Provider source {} failed for {}: {}", source.url(), key, e);
                last_error = ProbeError::Lookup(format!("failed fetching providers from url '{}': {}", source.url(), e));
            }
        }
    }
    Err(last_error)
}

/// Ask all sources concurrently and merge their answers. A peer reported by
/// several sources keeps its first position and the last record seen.
///
/// Individual failures are tolerated as long as some source answered; only
/// an empty merge with errors is reported, with every source's reason.
pub async fn find_all(sources: &[Arc<dyn ProviderSource>], key: &str) -> Result<Vec<Provider>, ProbeError> {
    if sources.is_empty() {
        return Err(ProbeError::Lookup("no provider sources configured".to_string()));
    }
    let results = join_all(sources.iter().map(|source| source.find_providers(key))).await;

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut providers: Vec<Provider> = Vec::new();
    let mut errors = Vec::new();
    for (source, result) in sources.iter().zip(results) {
        match result {
            Ok(found) => {
                for provider in found {
                    match seen.get(&provider.id) {
                        Some(&index) => providers[index] = provider,
                        None => {
                            seen.insert(provider.id.clone(), providers.len());
                            providers.push(provider);
                        }
                    }
                }
            }
            Err(e) => errors.push(format!("failed fetching providers from url '{}': {}", source.url(), e)),
        }
    }

    if providers.is_empty() && !errors.is_empty() {
        return Err(ProbeError::Lookup(errors.join(", ")));
    }
    Ok(providers)
}

/// Counts the peers announcing a node's pub/sub topic.
pub struct ContentRoutingProbe {
    kind: ProbeKind,
    strategy: LookupStrategy,
    count_field: &'static str,
    sources: Vec<Arc<dyn ProviderSource>>,
}

impl ContentRoutingProbe {
    /// Lookup through DHT-backed sources with ordered fallback.
    pub fn dht(sources: Vec<Arc<dyn ProviderSource>>) -> Self {
        Self {
            kind: ProbeKind::DhtProviders,
            strategy: LookupStrategy::FirstSuccess,
            count_field: "pubsubDhtPeerCount",
            sources,
        }
    }

    /// Lookup across every configured content router at once.
    pub fn routers(sources: Vec<Arc<dyn ProviderSource>>) -> Self {
        Self {
            kind: ProbeKind::RouterProviders,
            strategy: LookupStrategy::FanOut,
            count_field: "pubsubRouterPeerCount",
            sources,
        }
    }
}

#[async_trait]
impl Probe for ContentRoutingProbe {
    fn kind(&self) -> ProbeKind {
        self.kind
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let node = match target.require_node() {
            Ok(node) => node,
            Err(e) => return ProbeOutcome::failure(self.kind, target, 0, e),
        };
        let key = keys::topic_to_routing_key(&node.pubsub_topic);

        let start = Instant::now();
        let result = match self.strategy {
            LookupStrategy::FirstSuccess => find_first(&self.sources, &key).await,
            LookupStrategy::FanOut => find_all(&self.sources, &key).await,
        };
        match result {
            Ok(providers) => ProbeOutcome::success(self.kind, target, start.elapsed(), 1)
                .with(self.count_field, providers.len())
                .with("pubsubTopicRoutingCid", key),
            Err(e) => ProbeOutcome::failure(self.kind, target, 1, e).with("pubsubTopicRoutingCid", key),
        }
    }
}

/// Looks up the providers of each node's name record on one router.
pub struct NameProvidersProbe {
    sources: HashMap<String, Arc<dyn ProviderSource>>,
}

impl NameProvidersProbe {
    pub fn new(sources: Vec<Arc<dyn ProviderSource>>) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.url().to_string(), s)).collect(),
        }
    }
}

#[async_trait]
impl Probe for NameProvidersProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::NameProviders
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let node = match target.require_node() {
            Ok(node) => node,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 0, e),
        };
        let Some(source) = self.sources.get(target.id.trim_end_matches('/')) else {
            let e = ProbeError::Missing(format!("no provider source for router '{}'", target.id));
            return ProbeOutcome::failure(self.kind(), target, 0, e);
        };
        let key = match keys::routing_key_for_name(&node.identity) {
            Ok(key) => key,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 0, e),
        };

        let start = Instant::now();
        match find_first(std::slice::from_ref(source), &key).await {
            Ok(providers) => ProbeOutcome::success(self.kind(), target, start.elapsed(), 1)
                .with("providerCount", providers.len()),
            Err(e) => ProbeOutcome::failure(self.kind(), target, 1, e),
        }
    }
}

/// Announces a synthetic provider record to a router and reads it back.
pub struct RouterRoundTripProbe {
    http: HttpFetcher,
    announce_ip: OnceCell<String>,
    propagation_delay: Duration,
}

impl RouterRoundTripProbe {
    /// Without `announce_ip` the public address is discovered on first use.
    pub fn new(http: HttpFetcher, announce_ip: Option<String>) -> Self {
        Self {
            http,
            announce_ip: OnceCell::new_with(announce_ip),
            propagation_delay: super::PROPAGATION_DELAY,
        }
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    async fn own_ip(&self) -> Result<&str, ProbeError> {
        self.announce_ip
            .get_or_try_init(|| discover_ip(&self.http))
            .await
            .map(String::as_str)
    }

    async fn round_trip(&self, router: &HttpProviderSource) -> Result<(Duration, Duration), ProbeError> {
        let ip = self.own_ip().await?;
        let cid = keys::string_to_cid(&random_token());
        let peer_id = keys::random_identity();
        let body = provide_body(&cid, &peer_id, ip);

        let start = Instant::now();
        let response = router.provide(&body).await?;
        let provide_time = start.elapsed();
        if !response
            .pointer("/ProvideResults/0/AdvisoryTTL")
            .is_some_and(Value::is_number)
        {
            return Err(ProbeError::Mismatch(format!("provide response without AdvisoryTTL: {}", response)));
        }

        tokio::time::sleep(self.propagation_delay).await;

        let start = Instant::now();
        let providers = router.find_providers(&cid).await?;
        let find_time = start.elapsed();
        match providers.first() {
            Some(provider) if provider.id == peer_id => Ok((find_time, provide_time)),
            other => Err(ProbeError::Mismatch(format!(
                "first provider of {} is {:?}, expected '{}'",
                cid,
                other.map(|p| &p.id),
                peer_id
            ))),
        }
    }
}

fn random_token() -> String {
    rand::thread_rng().gen::<u64>().to_string()
}

/// Delegated routing v1 provide request for a synthetic bitswap record.
fn provide_body(cid: &str, peer_id: &str, ip: &str) -> Value {
    let version = if ip.contains(':') { 6 } else { 4 };
    json!({
        "Providers": [{
            "Schema": "bitswap",
            "Protocol": "transport-bitswap",
            "Signature": random_token(),
            "Payload": {
                "Keys": [cid],
                "Timestamp": chrono::Utc::now().timestamp_millis(),
                "AdvisoryTTL": ADVISORY_TTL_NANOS,
                "ID": peer_id,
                "Addrs": [
                    format!("/ip{}/{}/tcp/4001", version, ip),
                    format!("/ip{}/{}/udp/4001/quic-v1", version, ip),
                ],
            },
        }]
    })
}

/// Public address of this host, from a trace endpoint with a plain-text
/// fallback.
async fn discover_ip(http: &HttpFetcher) -> Result<String, ProbeError> {
    static TRACE_IP: OnceLock<Regex> = OnceLock::new();
    let pattern = TRACE_IP.get_or_init(|| Regex::new(r"ip=([^\n\r]+)").unwrap());

    match http.fetch_text(IP_TRACE_URL).await {
        Ok(body) => {
            if let Some(ip) = pattern.captures(&body).and_then(|c| c.get(1)) {
                return Ok(ip.as_str().trim().to_string());
            }
            tracing::debug!("No ip in trace response");
        }
        Err(e) => tracing::debug!("Failed fetching ip trace: {}", e),
    }
    let ip = http.fetch_text(IP_FALLBACK_URL).await?;
    let ip = ip.trim();
    if ip.is_empty() {
        return Err(ProbeError::Missing("could not discover public ip".to_string()));
    }
    Ok(ip.to_string())
}

#[async_trait]
impl Probe for RouterRoundTripProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::ProvideRoundTrip
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let router = HttpProviderSource::new(&target.id, self.http.clone());
        match self.round_trip(&router).await {
            Ok((find_time, provide_time)) => ProbeOutcome::success(self.kind(), target, find_time, 1)
                .with("lastProvideRequestTime", provide_time.as_secs_f64()),
            Err(e) => ProbeOutcome::failure(self.kind(), target, 1, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fakes::FakeProviderSource;
    use crate::probe::NodeInfo;
    use crate::state::Category;
    use crate::testutil::serve;
    use axum::{extract::Path, extract::State, routing::{get, put}, Json, Router};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn node() -> NodeInfo {
        NodeInfo {
            address: "node.example".to_string(),
            public_key: "umVN3GWZtpq4ZJokGwplTbyOt5HGJ03wDHTbQ4m3rxg".to_string(),
            identity: "12D3KooWNMybS8JqELi38ZBX897PrjWbCrGoMKfw3bgoqzC2n1Dh".to_string(),
            pubsub_topic: "topic".to_string(),
        }
    }

    fn sources(list: Vec<FakeProviderSource>) -> Vec<Arc<dyn ProviderSource>> {
        list.into_iter().map(|s| Arc::new(s) as Arc<dyn ProviderSource>).collect()
    }

    #[tokio::test]
    async fn test_fan_out_tolerates_partial_failure() {
        let sources = sources(vec![
            FakeProviderSource::ok("https://a.example", &["peer1"]),
            FakeProviderSource::err("https://b.example", "connection reset"),
        ]);
        let providers = find_all(&sources, "key").await.unwrap();
        assert_eq!(providers.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["peer1"]);
    }

    #[tokio::test]
    async fn test_fan_out_all_failed_combines_reasons() {
        let sources = sources(vec![
            FakeProviderSource::err("https://a.example", "reason one"),
            FakeProviderSource::err("https://b.example", "reason two"),
        ]);
        let message = find_all(&sources, "key").await.unwrap_err().to_string();
        assert!(message.contains("reason one"), "{}", message);
        assert!(message.contains("reason two"), "{}", message);
    }

    #[tokio::test]
    async fn test_fan_out_dedupes_and_allows_empty() {
        let sources = sources(vec![
            FakeProviderSource::ok("https://a.example", &["peer1", "peer2"]),
            FakeProviderSource::ok("https://b.example", &["peer2", "peer3"]),
        ]);
        assert_eq!(find_all(&sources, "key").await.unwrap().len(), 3);

        let mut later = FakeProviderSource::ok("https://b.example", &["peer2"]);
        if let Ok(found) = &mut later.result {
            found[0].addrs = vec!["/ip4/10.0.0.2/tcp/4001".to_string()];
        }
        let sources = self::sources(vec![FakeProviderSource::ok("https://a.example", &["peer1", "peer2"]), later]);
        let providers = find_all(&sources, "key").await.unwrap();
        assert_eq!(providers.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["peer1", "peer2"]);
        assert_eq!(providers[1].addrs, vec!["/ip4/10.0.0.2/tcp/4001"]);

        let empty = self::sources(vec![FakeProviderSource::ok("https://a.example", &[])]);
        assert!(find_all(&empty, "key").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_success_stops_early() {
        let first = Arc::new(FakeProviderSource::err("https://a.example", "down"));
        let second = Arc::new(FakeProviderSource::ok("https://b.example", &["peer1"]));
        let third = Arc::new(FakeProviderSource::ok("https://c.example", &["peer2"]));
        let list: Vec<Arc<dyn ProviderSource>> = vec![first.clone(), second.clone(), third.clone()];

        let providers = find_first(&list, "key").await.unwrap();
        assert_eq!(providers[0].id, "peer1");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_success_reports_last_error() {
        let list = sources(vec![
            FakeProviderSource::err("https://a.example", "first"),
            FakeProviderSource::err("https://b.example", "second"),
        ]);
        let message = find_first(&list, "key").await.unwrap_err().to_string();
        assert!(message.contains("https://b.example"));
        assert!(!message.contains("first"));
    }

    #[tokio::test]
    async fn test_routing_probe_outcome() {
        let probe = ContentRoutingProbe::routers(sources(vec![
            FakeProviderSource::ok("https://a.example", &["peer1"]),
            FakeProviderSource::err("https://b.example", "down"),
        ]));
        let target = Target::new(Category::ApplicationNode, "node.example").with_node(node());

        let outcome = probe.run(&target).await;
        assert!(outcome.success);
        assert_eq!(outcome.payload["pubsubRouterPeerCount"], 1);
        assert_eq!(outcome.payload["pubsubTopicRoutingCid"], keys::topic_to_routing_key("topic"));

        let failing = ContentRoutingProbe::dht(sources(vec![FakeProviderSource::err("https://a.example", "down")]));
        let outcome = failing.run(&target).await;
        assert!(!outcome.success);
        assert_eq!(outcome.fields()["pubsubDhtPeerCount"], 0);
    }

    #[tokio::test]
    async fn test_name_providers_per_router() {
        let probe = NameProvidersProbe::new(sources(vec![FakeProviderSource::ok(
            "https://router.example",
            &["peer1", "peer2"],
        )]));
        let target = Target::new(Category::ContentRouter, "https://router.example").with_node(node());

        let outcome = probe.run(&target).await;
        assert!(outcome.success);
        assert_eq!(outcome.payload["providerCount"], 2);
        assert_eq!(
            outcome.target.to_string(),
            "contentRouters:https://router.example#nodeProviders:node.example"
        );
    }

    type Records = Arc<Mutex<Vec<Value>>>;

    /// Router remembering provide requests and answering lookups from them.
    fn router() -> Router {
        let records: Records = Arc::default();
        Router::new()
            .route(
                "/routing/v1/providers",
                put(|State(records): State<Records>, Json(body): Json<Value>| async move {
                    records.lock().unwrap().push(body);
                    Json(json!({"ProvideResults": [{"AdvisoryTTL": 86400000000000u64}]}))
                }),
            )
            .route(
                "/routing/v1/providers/{cid}",
                get(|State(records): State<Records>, Path(cid): Path<String>| async move {
                    let providers: Vec<Value> = records
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|r| r["Providers"][0]["Payload"]["Keys"][0] == cid.as_str())
                        .map(|r| json!({"Schema": "peer", "ID": r["Providers"][0]["Payload"]["ID"]}))
                        .collect();
                    Json(json!({"Providers": providers}))
                }),
            )
            .with_state(records)
    }

    #[tokio::test]
    async fn test_router_round_trip() {
        let base = serve(router()).await;
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        let probe = RouterRoundTripProbe::new(http, Some("203.0.113.7".to_string()))
            .with_propagation_delay(Duration::ZERO);
        let target = Target::new(Category::ContentRouter, base);

        let outcome = probe.run(&target).await;
        assert!(outcome.success, "{:?}", outcome.reason);
        assert!(outcome.payload["lastProvideRequestTime"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_router_round_trip_missing_record() {
        let app = Router::new()
            .route("/routing/v1/providers", put(|| async { Json(json!({"ProvideResults": [{"AdvisoryTTL": 1}]})) }))
            .route("/routing/v1/providers/{cid}", get(|| async { Json(json!({"Providers": null})) }));
        let base = serve(app).await;
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        let probe = RouterRoundTripProbe::new(http, Some("2001:db8::1".to_string()))
            .with_propagation_delay(Duration::ZERO);

        let outcome = probe.run(&Target::new(Category::ContentRouter, base)).await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("first provider"));
    }

    #[test]
    fn test_provide_body_addresses() {
        let body = provide_body("bafkcid", "12D3KooWpeer", "2001:db8::1");
        let payload = &body["Providers"][0]["Payload"];
        assert_eq!(payload["Addrs"][0], "/ip6/2001:db8::1/tcp/4001");
        assert_eq!(payload["Addrs"][1], "/ip6/2001:db8::1/udp/4001/quic-v1");
        assert_eq!(payload["AdvisoryTTL"], ADVISORY_TTL_NANOS);
    }
}
