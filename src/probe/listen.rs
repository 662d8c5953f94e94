//! Persistent pub/sub listeners on application node topics.
//!
//! Unlike the other probes this is not request/response: one long-lived
//! subscription per node records when messages arrive, and a node that has
//! been silent for too long is sent a synthetic request to tell an idle node
//! apart from a silent relay.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::{NodeInfo, ProbeKind, ProbeOutcome, Target};
use crate::clients::{PubsubClient, PubsubMessage, Subscription};
use crate::keys;
use crate::registry::TargetRegistry;
use crate::scheduler::Reporter;
use crate::state::{Category, StateKey};

pub const MESSAGE_COUNT_METRIC: &str = "contrail_pubsub_message_count";

/// The part of a signed application message that identifies its author.
#[derive(Debug, Deserialize)]
struct SignedEnvelope {
    signature: Signature,
}

#[derive(Debug, Deserialize)]
struct Signature {
    #[serde(rename = "publicKey")]
    public_key: serde_bytes::ByteBuf,
}

/// The `signature.publicKey` bytes of a CBOR message, if it has one.
fn signer_public_key(data: &[u8]) -> Option<Vec<u8>> {
    serde_cbor::from_slice::<SignedEnvelope>(data)
        .ok()
        .map(|envelope| envelope.signature.public_key.into_vec())
}

/// Timing knobs for listeners.
#[derive(Debug, Clone)]
pub struct ListenTimings {
    /// Silence after which a node is provoked
    pub staleness: Duration,
    /// How often silence is re-checked
    pub recheck: Duration,
    pub peers_every: Duration,
    pub backoff_start: Duration,
    pub backoff_max: Duration,
}

impl Default for ListenTimings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(10 * 60),
            recheck: Duration::from_secs(5 * 60),
            peers_every: Duration::from_secs(10),
            backoff_start: Duration::from_secs(5),
            backoff_max: Duration::from_secs(80),
        }
    }
}

/// Whether a node whose last authoritative message was at `last` (unix
/// seconds) should be provoked at `now`.
pub fn needs_provoke(last: Option<i64>, now: i64, staleness: Duration) -> bool {
    match last {
        Some(last) => now - last >= staleness.as_secs() as i64,
        None => true,
    }
}

/// Starts one listener per known node and keeps them running until stopped.
pub struct ListenerSupervisor {
    client: Arc<dyn PubsubClient>,
    reporter: Arc<Reporter>,
    registry: Arc<TargetRegistry>,
    timings: ListenTimings,
    active: Mutex<HashSet<String>>,
    stop_tx: broadcast::Sender<()>,
}

impl ListenerSupervisor {
    pub fn new(
        client: Arc<dyn PubsubClient>,
        reporter: Arc<Reporter>,
        registry: Arc<TargetRegistry>,
        timings: ListenTimings,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            client,
            reporter,
            registry,
            timings,
            active: Mutex::new(HashSet::new()),
            stop_tx,
        }
    }

    /// Start listeners for nodes whose topic and key are known and that are
    /// not listened to yet. Returns how many were started.
    pub fn ensure_listeners(&self) -> usize {
        let state = self.reporter.state();
        let mut started = 0;
        for address in self.registry.nodes().iter() {
            let Some(node) = NodeInfo::lookup(state, address) else {
                tracing::debug!("No topic known for {} yet, not listening", address);
                continue;
            };
            {
                let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                if !active.insert(node.address.clone()) {
                    continue;
                }
            }
            tracing::info!("Listening to {} on topic {}", node.address, node.pubsub_topic);
            let listener = Arc::new(NodeListener::new(
                node,
                self.client.clone(),
                self.reporter.clone(),
                self.timings.clone(),
            ));
            listener.spawn(&self.stop_tx);
            started += 1;
        }
        started
    }

    /// Check for new nodes every `every` until stopped.
    pub fn spawn_loop(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        self.ensure_listeners();
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Subscription, peer poll and provoke tasks of one node.
pub struct NodeListener {
    node: NodeInfo,
    target: Target,
    expected_signer: Option<Vec<u8>>,
    client: Arc<dyn PubsubClient>,
    reporter: Arc<Reporter>,
    timings: ListenTimings,
}

impl NodeListener {
    pub fn new(node: NodeInfo, client: Arc<dyn PubsubClient>, reporter: Arc<Reporter>, timings: ListenTimings) -> Self {
        let expected_signer = keys::decode_public_key(&node.public_key).ok();
        let target = Target::new(Category::ApplicationNode, node.address.clone()).with_node(node.clone());
        Self {
            node,
            target,
            expected_signer,
            client,
            reporter,
            timings,
        }
    }

    fn key(&self) -> StateKey {
        StateKey::new(Category::ApplicationNode, self.node.address.clone())
    }

    pub fn spawn(self: Arc<Self>, stop_tx: &broadcast::Sender<()>) {
        tokio::spawn(self.clone().subscribe_loop(stop_tx.subscribe()));
        tokio::spawn(self.clone().peers_loop(stop_tx.subscribe()));
        tokio::spawn(self.provoke_loop(stop_tx.subscribe()));
    }

    /// Subscribe forever, reconnecting with doubling backoff.
    async fn subscribe_loop(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut backoff = self.timings.backoff_start;
        loop {
            match self.client.subscribe(&self.node.pubsub_topic).await {
                Ok(subscription) => {
                    backoff = self.timings.backoff_start;
                    if self.consume(subscription, &mut stop).await {
                        return;
                    }
                }
                Err(e) => tracing::warn!("Failed subscribing to {}: {}", self.node.pubsub_topic, e),
            }

            tokio::select! {
                _ = stop.recv() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.timings.backoff_max);
        }
    }

    /// Read messages until the stream ends. Returns true when stopped.
    async fn consume(&self, mut subscription: Box<dyn Subscription>, stop: &mut broadcast::Receiver<()>) -> bool {
        loop {
            let next = tokio::select! {
                _ = stop.recv() => None,
                message = subscription.next_message() => Some(message),
            };
            match next {
                None => {
                    if let Err(e) = subscription.unsubscribe().await {
                        tracing::debug!("Failed unsubscribing from {}: {}", self.node.pubsub_topic, e);
                    }
                    return true;
                }
                Some(Ok(Some(message))) => self.on_message(&message),
                Some(Ok(None)) => {
                    tracing::warn!("Subscription to {} closed, reconnecting", self.node.pubsub_topic);
                    return false;
                }
                Some(Err(e)) => {
                    tracing::warn!("Subscription to {} failed: {}", self.node.pubsub_topic, e);
                    return false;
                }
            }
        }
    }

    pub fn on_message(&self, message: &PubsubMessage) {
        let state = self.reporter.state();
        let key = self.key();
        let now = Utc::now().timestamp();

        state.increment(&key, "pubsubMessageCount", 1);
        let mut fields = Map::new();
        fields.insert("lastPubsubMessageTimestamp".to_string(), json!(now));
        let signer = signer_public_key(&message.data);
        if signer.is_some() && signer == self.expected_signer {
            fields.insert("lastAuthoritativeMessageTimestamp".to_string(), json!(now));
        }
        state.merge(&key, fields);

        self.reporter.metrics().increment(
            MESSAGE_COUNT_METRIC,
            &[(Category::ApplicationNode.label_name(), &self.node.address)],
            1.0,
        );
    }

    async fn peers_loop(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.timings.peers_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.recv() => return,
                _ = interval.tick() => {
                    let outcome = self.poll_peers().await;
                    self.reporter.report(&outcome);
                }
            }
        }
    }

    async fn poll_peers(&self) -> ProbeOutcome {
        let kind = ProbeKind::PubsubPeers;
        let start = Instant::now();
        match self.client.peers(&self.node.pubsub_topic).await {
            Ok(peers) => ProbeOutcome::success(kind, &self.target, start.elapsed(), 1).with("pubsubPeerCount", peers.len()),
            Err(e) => ProbeOutcome::failure(kind, &self.target, 1, e),
        }
    }

    async fn provoke_loop(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let first = tokio::time::Instant::now() + self.timings.staleness;
        let mut interval = tokio::time::interval_at(first, self.timings.recheck);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.recv() => return,
                _ = interval.tick() => {
                    if let Some(outcome) = self.provoke_if_stale().await {
                        self.reporter.report(&outcome);
                    }
                }
            }
        }
    }

    /// Publish a synthetic request when the node has been silent too long.
    pub async fn provoke_if_stale(&self) -> Option<ProbeOutcome> {
        let last = self
            .reporter
            .state()
            .get(&self.key())
            .and_then(|record| record.get("lastAuthoritativeMessageTimestamp").and_then(|v| v.as_i64()));
        if !needs_provoke(last, Utc::now().timestamp(), self.timings.staleness) {
            return None;
        }

        tracing::debug!("No authoritative message from {} recently, provoking", self.node.address);
        let request = json!({
            "type": "ContrailProbeRequest",
            "id": keys::random_identity(),
            "timestamp": Utc::now().timestamp(),
        });
        let kind = ProbeKind::ProvokePublish;
        let start = Instant::now();
        let outcome = match self
            .client
            .publish(&self.node.pubsub_topic, request.to_string().as_bytes())
            .await
        {
            Ok(()) => ProbeOutcome::success(kind, &self.target, start.elapsed(), 1),
            Err(e) => ProbeOutcome::failure(kind, &self.target, 1, e),
        };
        Some(outcome)
    }
}
