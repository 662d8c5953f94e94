//! Metrics exposition.
//!
//! Every metric is declared once in a static table mapping a probe kind and
//! an observed value to a metric name and type. Label sets come from the
//! target's category, so no metric name is ever built at runtime.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;

use crate::probe::{ProbeKind, ProbeOutcome};

/// Receives probe outcomes and ad hoc counter updates.
pub trait MetricsSink: Send + Sync {
    fn observe(&self, outcome: &ProbeOutcome);
    fn increment(&self, name: &'static str, labels: &[(&str, &str)], by: f64);
    fn set(&self, name: &'static str, labels: &[(&str, &str)], value: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Which part of an outcome a metric reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// One per run
    Run,
    /// 1 or 0
    Success,
    /// Seconds, 0 on failure
    Latency,
    Attempts,
    /// A numeric payload field
    Field(&'static str),
}

#[derive(Debug)]
pub struct MetricDef {
    pub kind: Option<ProbeKind>,
    pub source: Source,
    pub metric_type: MetricType,
    pub name: &'static str,
    pub help: &'static str,
}

macro_rules! metric {
    ($type:ident, $name:literal, $help:literal) => {
        MetricDef {
            kind: None,
            source: Source::Run,
            metric_type: MetricType::$type,
            name: $name,
            help: $help,
        }
    };
    ($kind:ident, $source:expr, $type:ident, $name:literal, $help:literal) => {
        MetricDef {
            kind: Some(ProbeKind::$kind),
            source: $source,
            metric_type: MetricType::$type,
            name: $name,
            help: $help,
        }
    };
}

use Source::*;

pub static METRICS: &[MetricDef] = &[
    metric!(ContentFetch, Run, Counter, "contrail_gateway_fetch_count", "Content round trips through a gateway"),
    metric!(ContentFetch, Success, Gauge, "contrail_gateway_fetch_success", "Whether the last content round trip succeeded"),
    metric!(ContentFetch, Latency, Gauge, "contrail_gateway_fetch_duration_seconds", "Time to fetch and verify content"),
    metric!(ContentFetch, Attempts, Gauge, "contrail_gateway_fetch_attempts", "Attempts used by the last content fetch"),
    metric!(SnapshotFetch, Run, Counter, "contrail_gateway_snapshot_fetch_count", "Node record fetches through a gateway"),
    metric!(SnapshotFetch, Success, Gauge, "contrail_gateway_snapshot_fetch_success", "Whether the last node record fetch succeeded"),
    metric!(SnapshotFetch, Latency, Gauge, "contrail_gateway_snapshot_fetch_duration_seconds", "Time to fetch a node record"),
    metric!(SnapshotFetch, Attempts, Gauge, "contrail_gateway_snapshot_fetch_attempts", "Attempts used by the last node record fetch"),
    metric!(SnapshotFetch, Field("secondsSinceUpdate"), Gauge, "contrail_gateway_snapshot_seconds_since_update", "Age of the node record served by the gateway"),
    metric!(NodeUpdate, Run, Counter, "contrail_node_update_fetch_count", "Node record fetches from the reference gateway"),
    metric!(NodeUpdate, Success, Gauge, "contrail_node_update_fetch_success", "Whether the last node record fetch succeeded"),
    metric!(NodeUpdate, Latency, Gauge, "contrail_node_update_fetch_duration_seconds", "Time to fetch a node record"),
    metric!(NodeUpdate, Attempts, Gauge, "contrail_node_update_fetch_attempts", "Attempts used by the last node record fetch"),
    metric!(NodeUpdate, Field("secondsSinceUpdate"), Gauge, "contrail_node_seconds_since_update", "Age of the node's latest record"),
    metric!(DhtProviders, Run, Counter, "contrail_node_dht_peers_fetch_count", "Topic provider lookups through the DHT"),
    metric!(DhtProviders, Success, Gauge, "contrail_node_dht_peers_fetch_success", "Whether the last DHT lookup succeeded"),
    metric!(DhtProviders, Latency, Gauge, "contrail_node_dht_peers_fetch_duration_seconds", "Time of the last DHT lookup"),
    metric!(DhtProviders, Field("pubsubDhtPeerCount"), Gauge, "contrail_node_dht_peer_count", "Topic providers found in the DHT"),
    metric!(RouterProviders, Run, Counter, "contrail_node_router_peers_fetch_count", "Topic provider lookups across content routers"),
    metric!(RouterProviders, Success, Gauge, "contrail_node_router_peers_fetch_success", "Whether the last router lookup succeeded"),
    metric!(RouterProviders, Latency, Gauge, "contrail_node_router_peers_fetch_duration_seconds", "Time of the last router lookup"),
    metric!(RouterProviders, Field("pubsubRouterPeerCount"), Gauge, "contrail_node_router_peer_count", "Topic providers found across content routers"),
    metric!(PubsubPeers, Run, Counter, "contrail_node_pubsub_peers_fetch_count", "Relay peer list polls"),
    metric!(PubsubPeers, Success, Gauge, "contrail_node_pubsub_peers_fetch_success", "Whether the last peer poll succeeded"),
    metric!(PubsubPeers, Latency, Gauge, "contrail_node_pubsub_peers_fetch_duration_seconds", "Time of the last peer poll"),
    metric!(PubsubPeers, Field("pubsubPeerCount"), Gauge, "contrail_node_pubsub_peer_count", "Relay peers on the node's topic"),
    metric!(ProvokePublish, Run, Counter, "contrail_node_provoke_count", "Synthetic requests sent to silent nodes"),
    metric!(ProvokePublish, Success, Gauge, "contrail_node_provoke_success", "Whether the last synthetic request was published"),
    metric!(ProvokePublish, Latency, Gauge, "contrail_node_provoke_duration_seconds", "Time to publish the last synthetic request"),
    metric!(NameProviders, Run, Counter, "contrail_router_providers_fetch_count", "Name record provider lookups on a router"),
    metric!(NameProviders, Success, Gauge, "contrail_router_providers_fetch_success", "Whether the last name record lookup succeeded"),
    metric!(NameProviders, Latency, Gauge, "contrail_router_providers_fetch_duration_seconds", "Time of the last name record lookup"),
    metric!(NameProviders, Field("providerCount"), Gauge, "contrail_router_provider_count", "Providers of a node's name record"),
    metric!(ProvideRoundTrip, Run, Counter, "contrail_router_provide_count", "Provider record round trips"),
    metric!(ProvideRoundTrip, Success, Gauge, "contrail_router_provide_success", "Whether the last provider record round trip succeeded"),
    metric!(ProvideRoundTrip, Latency, Gauge, "contrail_router_provide_duration_seconds", "Time to read back an announced provider record"),
    metric!(RelayRoundTrip, Run, Counter, "contrail_relay_publish_count", "Publish round trips through a relay"),
    metric!(RelayRoundTrip, Success, Gauge, "contrail_relay_publish_success", "Whether the last publish round trip succeeded"),
    metric!(RelayRoundTrip, Latency, Gauge, "contrail_relay_publish_duration_seconds", "Time for messages to cross the relay both ways"),
    metric!(NameResolve, Run, Counter, "contrail_name_service_resolve_count", "Name resolutions"),
    metric!(NameResolve, Success, Gauge, "contrail_name_service_resolve_success", "Whether the last resolution returned an identity"),
    metric!(NameResolve, Latency, Gauge, "contrail_name_service_resolve_duration_seconds", "Time of the last resolution"),
    metric!(PageFetch, Run, Counter, "contrail_page_fetch_count", "Static page fetches"),
    metric!(PageFetch, Success, Gauge, "contrail_page_fetch_success", "Whether the last page fetch matched"),
    metric!(PageFetch, Latency, Gauge, "contrail_page_fetch_duration_seconds", "Time of the last page fetch"),
    metric!(Gauge, "contrail_up", "Whether the monitor is running"),
    metric!(Counter, "contrail_pubsub_message_count", "Messages received on a node's topic"),
];

fn describe(name: &str) -> Option<&'static MetricDef> {
    METRICS.iter().find(|def| def.name == name)
}

type LabelSet = Vec<(String, String)>;

/// In-memory registry rendering the Prometheus text format.
pub struct MetricsRegistry {
    series: Mutex<BTreeMap<&'static str, BTreeMap<LabelSet, f64>>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Self {
            series: Mutex::new(BTreeMap::new()),
        };
        registry.set("contrail_up", &[], 1.0);
        registry
    }

    fn update(&self, name: &'static str, labels: &[(&str, &str)], apply: impl FnOnce(&mut f64)) {
        let labels: LabelSet = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        apply(series.entry(name).or_default().entry(labels).or_insert(0.0));
    }

    /// Text exposition of every series, grouped by metric.
    pub fn render(&self) -> String {
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for def in METRICS {
            let Some(values) = series.get(def.name) else {
                continue;
            };
            let _ = writeln!(out, "# HELP {} {}", def.name, def.help);
            let _ = writeln!(out, "# TYPE {} {}", def.name, def.metric_type.as_str());
            for (labels, value) in values {
                let _ = writeln!(out, "{}{} {}", def.name, render_labels(labels), value);
            }
        }
        out
    }
}

fn render_labels(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl MetricsSink for MetricsRegistry {
    fn observe(&self, outcome: &ProbeOutcome) {
        let target = &outcome.target;
        let mut labels: Vec<(&str, &str)> = vec![(target.category.label_name(), target.target.as_str())];
        if let Some((_, node)) = &target.nested {
            labels.push(("node_address", node.as_str()));
        }
        let fields = outcome.fields();

        for def in METRICS.iter().filter(|def| def.kind == Some(outcome.kind)) {
            let value = match def.source {
                Source::Run => 1.0,
                Source::Success => f64::from(u8::from(outcome.success)),
                Source::Latency => outcome.latency.unwrap_or(0.0),
                Source::Attempts => outcome.attempts as f64,
                Source::Field(field) => match fields.get(field).and_then(Value::as_f64) {
                    Some(value) => value,
                    None => continue,
                },
            };
            match def.metric_type {
                MetricType::Counter => self.increment(def.name, &labels, value),
                MetricType::Gauge => self.set(def.name, &labels, value),
            }
        }
    }

    fn increment(&self, name: &'static str, labels: &[(&str, &str)], by: f64) {
        if describe(name).is_none() {
            tracing::debug!("Ignoring undeclared metric {}", name);
            return;
        }
        self.update(name, labels, |value| *value += by);
    }

    fn set(&self, name: &'static str, labels: &[(&str, &str)], value: f64) {
        if describe(name).is_none() {
            tracing::debug!("Ignoring undeclared metric {}", name);
            return;
        }
        self.update(name, labels, |v| *v = value);
    }
}
