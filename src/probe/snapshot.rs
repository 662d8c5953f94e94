//! Mutable record fetches: node updates and per-gateway snapshots.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use super::{seconds_since, Probe, ProbeError, ProbeKind, ProbeOutcome, Target, FETCH_RETRIES};
use crate::clients::{HttpFetcher, NameResolver};
use crate::keys;

/// TXT record carrying a node's identity for human-readable addresses.
pub const DNSLINK_RECORD: &str = "_dnslink";

fn signature_public_key(record: &Value) -> Option<&str> {
    record.get("signature")?.get("publicKey")?.as_str()
}

fn updated_at(record: &Value) -> Option<i64> {
    record.get("updatedAt").and_then(Value::as_i64)
}

/// Fetches a node's latest record through the gateway under test and
/// checks it is signed by the node's known key.
pub struct DomainSnapshotProbe {
    http: HttpFetcher,
}

impl DomainSnapshotProbe {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Probe for DomainSnapshotProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::SnapshotFetch
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let node = match target.require_node() {
            Ok(node) => node,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 0, e),
        };
        let url = format!("{}/ipns/{}", target.id.trim_end_matches('/'), node.identity);

        let start = Instant::now();
        let (result, attempts) = self.http.fetch_json_retry(&url, FETCH_RETRIES).await;
        let record = match result {
            Ok(record) => record,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, attempts, e),
        };
        let latency = start.elapsed();

        match signature_public_key(&record) {
            Some(key) if key == node.public_key => {}
            other => {
                let e = ProbeError::Mismatch(format!(
                    "record of '{}' signed by {:?}, expected '{}'",
                    node.address, other, node.public_key
                ));
                return ProbeOutcome::failure(self.kind(), target, attempts, e);
            }
        }

        let mut outcome = ProbeOutcome::success(self.kind(), target, latency, attempts);
        if let Some(updated_at) = updated_at(&record) {
            outcome = outcome.with("lastSnapshotUpdatedAt", updated_at);
            if let Some(seconds) = seconds_since(updated_at) {
                outcome = outcome.with("secondsSinceUpdate", seconds);
            }
        }
        outcome
    }
}

/// Learns an application node's signing key, topic and stats from its
/// latest record on the reference gateway.
pub struct NodeUpdateProbe {
    http: HttpFetcher,
    gateway: String,
    resolver: Option<Arc<dyn NameResolver>>,
}

impl NodeUpdateProbe {
    pub fn new(http: HttpFetcher, gateway: &str, resolver: Option<Arc<dyn NameResolver>>) -> Self {
        Self {
            http,
            gateway: gateway.trim_end_matches('/').to_string(),
            resolver,
        }
    }

    /// Identity behind a node address: the address itself, or the dnslink
    /// record of a human-readable name.
    async fn resolve_identity(&self, address: &str) -> Result<String, ProbeError> {
        if keys::is_identity(address) {
            return Ok(address.to_string());
        }
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| ProbeError::Missing(format!("no resolver for address '{}'", address)))?;
        match resolver.resolve(address, DNSLINK_RECORD).await? {
            Some(identity) if keys::is_identity(&identity) => Ok(identity),
            Some(other) => Err(ProbeError::Mismatch(format!(
                "'{}' resolved to '{}' which is not an identity",
                address, other
            ))),
            None => Err(ProbeError::Missing(format!("'{}' has no {} record", address, DNSLINK_RECORD))),
        }
    }

    async fn fetch_stats(&self, stats_cid: &str) -> Option<Value> {
        let url = format!("{}/ipfs/{}", self.gateway, stats_cid);
        match self.http.fetch_json(&url).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!("Failed fetching stats {}: {}", stats_cid, e);
                None
            }
        }
    }
}

/// Check that a base64 public key derives to `identity`. Identities are
/// compared as bytes since a node may be addressed in any supported encoding.
fn verify_signer(public_key: &str, identity: &str) -> Result<(), ProbeError> {
    let derived = keys::public_key_b64_to_address(public_key)?;
    if keys::parse_identity(&derived)? != keys::parse_identity(identity)? {
        return Err(ProbeError::Mismatch(format!(
            "record public key derives to '{}', expected '{}'",
            derived, identity
        )));
    }
    Ok(())
}

#[async_trait]
impl Probe for NodeUpdateProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::NodeUpdate
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let identity = match self.resolve_identity(&target.id).await {
            Ok(identity) => identity,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, 0, e),
        };
        let url = format!("{}/ipns/{}", self.gateway, identity);

        let start = Instant::now();
        let (result, attempts) = self.http.fetch_json_retry(&url, FETCH_RETRIES).await;
        let record = match result {
            Ok(record) => record,
            Err(e) => return ProbeOutcome::failure(self.kind(), target, attempts, e),
        };
        let latency = start.elapsed();

        let Some(public_key) = signature_public_key(&record).map(str::to_string) else {
            let e = ProbeError::Missing(format!("record of '{}' has no signature public key", target.id));
            return ProbeOutcome::failure(self.kind(), target, attempts, e);
        };
        if let Err(e) = verify_signer(&public_key, &identity) {
            return ProbeOutcome::failure(self.kind(), target, attempts, e);
        }

        let pubsub_topic = record
            .get("pubsubTopic")
            .and_then(Value::as_str)
            .unwrap_or(&identity)
            .to_string();
        let mut outcome = ProbeOutcome::success(self.kind(), target, latency, attempts)
            .with("publicKey", public_key)
            .with("pubsubTopic", pubsub_topic)
            .with("identity", identity.clone());
        if let Some(updated_at) = updated_at(&record) {
            outcome = outcome.with("lastUpdateTimestamp", updated_at);
            if let Some(seconds) = seconds_since(updated_at) {
                outcome = outcome.with("secondsSinceUpdate", seconds);
            }
        }
        if let Some(stats_cid) = record.get("statsCid").and_then(Value::as_str) {
            if let Some(stats) = self.fetch_stats(stats_cid).await {
                outcome = outcome.with("stats", stats);
            }
        }
        outcome
    }
}
