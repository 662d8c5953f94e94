//! Probe module for network monitoring.
//!
//! Every probe performs one synthetic round trip against one target and
//! reports a [`ProbeOutcome`]. Probes never return errors: any failure is
//! captured in the outcome with `success: false` and a reason.

mod gateway;
mod listen;
mod name;
mod pubsub;
mod routing;
mod snapshot;
mod webpage;

pub use gateway::*;
pub use listen::*;
pub use name::*;
pub use pubsub::*;
pub use routing::*;
pub use snapshot::*;
pub use webpage::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::clients::ClientError;
use crate::keys::{self, KeyError};
use crate::state::{Category, StateKey, StateStore};

/// Retries after the first attempt for fetches that retry.
pub const FETCH_RETRIES: u32 = 3;

/// Probe error types. Rendered into the outcome reason, never propagated.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("verification failed: {0}")]
    Mismatch(String),
    #[error("{0}")]
    Missing(String),
    #[error("{0}")]
    Lookup(String),
}

/// Prerequisite data learned about an application node by the update probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub address: String,
    /// Base64 ed25519 public key the node signs with
    pub public_key: String,
    /// Identity derived from the public key
    pub identity: String,
    pub pubsub_topic: String,
}

impl NodeInfo {
    /// Look up the node's learned fields; `None` until they are all known.
    pub fn lookup(state: &StateStore, address: &str) -> Option<NodeInfo> {
        let record = state.get(&StateKey::new(Category::ApplicationNode, address))?;
        let public_key = record.get("publicKey")?.as_str()?.to_string();
        let pubsub_topic = record.get("pubsubTopic")?.as_str()?.to_string();
        let identity = keys::public_key_b64_to_address(&public_key).ok()?;
        Some(NodeInfo {
            address: address.to_string(),
            public_key,
            identity,
            pubsub_topic,
        })
    }
}

/// Category-specific target metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMeta {
    Endpoint,
    NameService { name: String, record: String },
    StaticPage { pattern: String },
}

/// A monitored endpoint, optionally paired with the application node the
/// probe is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub category: Category,
    /// URL or node address
    pub id: String,
    pub node: Option<NodeInfo>,
    pub meta: TargetMeta,
}

impl Target {
    pub fn new(category: Category, id: impl Into<String>) -> Self {
        Self {
            category,
            id: id.into(),
            node: None,
            meta: TargetMeta::Endpoint,
        }
    }

    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_meta(mut self, meta: TargetMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Where outcomes of `kind` against this target are recorded.
    pub fn key(&self, kind: ProbeKind) -> StateKey {
        let key = StateKey::new(self.category, self.id.clone());
        match (kind.spec().nested, &self.node) {
            (Some(field), Some(node)) => key.nested(field, node.address.clone()),
            _ => key,
        }
    }

    pub fn require_node(&self) -> Result<&NodeInfo, ProbeError> {
        self.node
            .as_ref()
            .ok_or_else(|| ProbeError::Missing(format!("no node data for '{}' yet", self.id)))
    }
}

/// Kind of check a probe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeKind {
    ContentFetch,
    SnapshotFetch,
    NodeUpdate,
    DhtProviders,
    RouterProviders,
    PubsubPeers,
    NameProviders,
    ProvideRoundTrip,
    RelayRoundTrip,
    ProvokePublish,
    NameResolve,
    PageFetch,
}

/// State field names a probe kind reports into.
#[derive(Debug)]
pub struct KindSpec {
    pub name: &'static str,
    pub category: Category,
    /// Per-node sub-record field, for probes about a node on another target
    pub nested: Option<&'static str>,
    pub count: &'static str,
    pub success: &'static str,
    pub latency: &'static str,
    pub attempts: Option<&'static str>,
    /// Numeric payload fields zero-filled on failure
    pub zero_fields: &'static [&'static str],
    /// Whether runs are kept in the outcome log for reliability stats
    pub logged: bool,
}

macro_rules! kind_spec {
    ($name:literal, $category:ident, $nested:expr, $count:literal, $success:literal, $latency:literal, $attempts:expr, $zero:expr, $logged:literal) => {
        KindSpec {
            name: $name,
            category: Category::$category,
            nested: $nested,
            count: $count,
            success: $success,
            latency: $latency,
            attempts: $attempts,
            zero_fields: $zero,
            logged: $logged,
        }
    };
}

static CONTENT_FETCH: KindSpec = kind_spec!("contentFetch", Gateway, None, "fetchCount", "lastFetchSuccess", "lastFetchTime", Some("lastFetchAttemptCount"), &[], true);
static SNAPSHOT_FETCH: KindSpec = kind_spec!("snapshotFetch", Gateway, Some("nodeSnapshots"), "snapshotFetchCount", "lastSnapshotFetchSuccess", "lastSnapshotFetchTime", Some("lastSnapshotFetchAttemptCount"), &[], true);
static NODE_UPDATE: KindSpec = kind_spec!("nodeUpdate", ApplicationNode, None, "updateFetchCount", "lastUpdateFetchSuccess", "lastUpdateFetchTime", Some("lastUpdateFetchAttemptCount"), &[], true);
static DHT_PROVIDERS: KindSpec = kind_spec!("dhtProviders", ApplicationNode, None, "dhtPeersFetchCount", "lastDhtPeersFetchSuccess", "lastDhtPeersFetchTime", None, &["pubsubDhtPeerCount"], true);
static ROUTER_PROVIDERS: KindSpec = kind_spec!("routerProviders", ApplicationNode, None, "routerPeersFetchCount", "lastRouterPeersFetchSuccess", "lastRouterPeersFetchTime", None, &["pubsubRouterPeerCount"], true);
static PUBSUB_PEERS: KindSpec = kind_spec!("pubsubPeers", ApplicationNode, None, "pubsubPeersFetchCount", "lastPubsubPeersFetchSuccess", "lastPubsubPeersFetchTime", None, &["pubsubPeerCount"], false);
static NAME_PROVIDERS: KindSpec = kind_spec!("nameProviders", ContentRouter, Some("nodeProviders"), "providersFetchCount", "lastProvidersFetchSuccess", "lastProvidersFetchTime", None, &["providerCount"], true);
static PROVIDE_ROUND_TRIP: KindSpec = kind_spec!("provideRoundTrip", ContentRouter, None, "provideCount", "lastProvideSuccess", "lastProvideTime", None, &[], true);
static RELAY_ROUND_TRIP: KindSpec = kind_spec!("relayRoundTrip", Relay, None, "publishCount", "lastPublishSuccess", "lastPublishTime", None, &[], true);
static PROVOKE_PUBLISH: KindSpec = kind_spec!("provokePublish", ApplicationNode, None, "provokeCount", "lastProvokeSuccess", "lastProvokeTime", None, &[], true);
static NAME_RESOLVE: KindSpec = kind_spec!("nameResolve", NameService, None, "resolveCount", "lastResolveSuccess", "lastResolveTime", None, &[], true);
static PAGE_FETCH: KindSpec = kind_spec!("pageFetch", StaticPage, None, "fetchCount", "lastFetchSuccess", "lastFetchTime", None, &[], true);

impl ProbeKind {
    pub const ALL: [ProbeKind; 12] = [
        ProbeKind::ContentFetch,
        ProbeKind::SnapshotFetch,
        ProbeKind::NodeUpdate,
        ProbeKind::DhtProviders,
        ProbeKind::RouterProviders,
        ProbeKind::PubsubPeers,
        ProbeKind::NameProviders,
        ProbeKind::ProvideRoundTrip,
        ProbeKind::RelayRoundTrip,
        ProbeKind::ProvokePublish,
        ProbeKind::NameResolve,
        ProbeKind::PageFetch,
    ];

    pub fn spec(&self) -> &'static KindSpec {
        match self {
            ProbeKind::ContentFetch => &CONTENT_FETCH,
            ProbeKind::SnapshotFetch => &SNAPSHOT_FETCH,
            ProbeKind::NodeUpdate => &NODE_UPDATE,
            ProbeKind::DhtProviders => &DHT_PROVIDERS,
            ProbeKind::RouterProviders => &ROUTER_PROVIDERS,
            ProbeKind::PubsubPeers => &PUBSUB_PEERS,
            ProbeKind::NameProviders => &NAME_PROVIDERS,
            ProbeKind::ProvideRoundTrip => &PROVIDE_ROUND_TRIP,
            ProbeKind::RelayRoundTrip => &RELAY_ROUND_TRIP,
            ProbeKind::ProvokePublish => &PROVOKE_PUBLISH,
            ProbeKind::NameResolve => &NAME_RESOLVE,
            ProbeKind::PageFetch => &PAGE_FETCH,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().name
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown probe kind '{}'", s))
    }
}

/// Result of one probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub kind: ProbeKind,
    pub target: StateKey,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Seconds, absent on failure
    pub latency: Option<f64>,
    pub attempts: u32,
    /// Extra observations, merged into state as-is
    pub payload: Map<String, Value>,
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn success(kind: ProbeKind, target: &Target, latency: Duration, attempts: u32) -> Self {
        Self {
            kind,
            target: target.key(kind),
            timestamp: Utc::now(),
            success: true,
            latency: Some(latency.as_secs_f64()),
            attempts,
            payload: Map::new(),
            reason: None,
        }
    }

    pub fn failure(kind: ProbeKind, target: &Target, attempts: u32, reason: impl ToString) -> Self {
        Self {
            kind,
            target: target.key(kind),
            timestamp: Utc::now(),
            success: false,
            latency: None,
            attempts,
            payload: Map::new(),
            reason: Some(reason.to_string()),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(field.to_string(), value.into());
        self
    }

    /// State fields this outcome sets. Failures zero-fill numeric fields so
    /// readers never see them missing.
    pub fn fields(&self) -> Map<String, Value> {
        let spec = self.kind.spec();
        let mut fields = self.payload.clone();
        fields.insert(spec.success.to_string(), json!(self.success));
        fields.insert(spec.latency.to_string(), json!(self.latency.unwrap_or(0.0)));
        if let Some(attempts) = spec.attempts {
            fields.insert(attempts.to_string(), json!(self.attempts));
        }
        if !self.success {
            for name in spec.zero_fields {
                fields.entry(name.to_string()).or_insert(json!(0));
            }
        }
        fields
    }
}

/// A single kind of synthetic check.
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Run once against `target`. Must not panic or return early without an
    /// outcome; failures are reported through the outcome.
    async fn run(&self, target: &Target) -> ProbeOutcome;
}

/// Seconds between a unix timestamp and now, if the timestamp is sane.
pub fn seconds_since(timestamp: i64) -> Option<i64> {
    if timestamp <= 0 {
        return None;
    }
    Some(Utc::now().timestamp() - timestamp)
}

#[cfg(test)]
pub(crate) mod fakes;
