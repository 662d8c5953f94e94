//! Health state store.
//!
//! Holds the latest known fields for every monitored target as a JSON
//! document grouped by category. Updates are shallow merges: new fields win,
//! omitted fields persist, and a field is only ever removed by a migration.

mod migrations;

pub use migrations::*;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::db::Store;

/// Category of monitored endpoint. The serialized name is the top-level key
/// of the state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "gateways")]
    Gateway,
    #[serde(rename = "contentRouters")]
    ContentRouter,
    #[serde(rename = "relays")]
    Relay,
    #[serde(rename = "nameServices")]
    NameService,
    #[serde(rename = "nodes")]
    ApplicationNode,
    #[serde(rename = "staticPages")]
    StaticPage,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Gateway,
        Category::ContentRouter,
        Category::Relay,
        Category::NameService,
        Category::ApplicationNode,
        Category::StaticPage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Gateway => "gateways",
            Category::ContentRouter => "contentRouters",
            Category::Relay => "relays",
            Category::NameService => "nameServices",
            Category::ApplicationNode => "nodes",
            Category::StaticPage => "staticPages",
        }
    }

    /// Metric label carrying the target identity for this category.
    pub fn label_name(&self) -> &'static str {
        match self {
            Category::Gateway => "gateway_url",
            Category::ContentRouter => "router_url",
            Category::Relay => "relay_url",
            Category::NameService => "name_service_url",
            Category::ApplicationNode => "node_address",
            Category::StaticPage => "page_url",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// Location of a target's fields in the state document.
///
/// `nested` addresses a per-node sub-record under a target, e.g. the
/// snapshot fetches a gateway performed for each application node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub category: Category,
    pub target: String,
    pub nested: Option<(&'static str, String)>,
}

impl StateKey {
    pub fn new(category: Category, target: impl Into<String>) -> Self {
        Self {
            category,
            target: target.into(),
            nested: None,
        }
    }

    pub fn nested(mut self, field: &'static str, key: impl Into<String>) -> Self {
        self.nested = Some((field, key.into()));
        self
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.target)?;
        if let Some((field, key)) = &self.nested {
            write!(f, "#{}:{}", field, key)?;
        }
        Ok(())
    }
}

/// Shared, in-memory state document.
///
/// The lock is only held for the duration of a single merge or read and
/// never across an await point. Concurrent merges to the same target race
/// with last-write-wins per field.
pub struct StateStore {
    doc: RwLock<Map<String, Value>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::from_document(Value::Null)
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a previously persisted document, migrating it to
    /// the current schema first.
    pub fn from_document(doc: Value) -> Self {
        Self {
            doc: RwLock::new(migrate(doc)),
        }
    }

    /// Load the last persisted document from the database, if any.
    pub fn load(store: &Store) -> Self {
        match store.load_state() {
            Ok(Some(doc)) => {
                tracing::info!("Loaded persisted health state");
                Self::from_document(doc)
            }
            Ok(None) => Self::new(),
            Err(e) => {
                tracing::error!("Failed to load persisted health state: {}", e);
                Self::new()
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Map<String, Value>> {
        self.doc.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Map<String, Value>> {
        self.doc.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Shallow-merge `fields` into the record at `key`.
    pub fn merge(&self, key: &StateKey, fields: Map<String, Value>) {
        let mut doc = self.write();
        let entry = entry_mut(&mut doc, key);
        for (name, value) in fields {
            entry.insert(name, value);
        }
    }

    /// Increment a monotonic counter field and return its new value.
    pub fn increment(&self, key: &StateKey, field: &str, by: u64) -> u64 {
        let mut doc = self.write();
        let entry = entry_mut(&mut doc, key);
        let next = entry.get(field).and_then(Value::as_u64).unwrap_or(0) + by;
        entry.insert(field.to_string(), json!(next));
        next
    }

    /// Copy of the record at `key`.
    pub fn get(&self, key: &StateKey) -> Option<Map<String, Value>> {
        let doc = self.read();
        let mut value = doc.get(key.category.as_str())?.get(&key.target)?;
        if let Some((field, nested_key)) = &key.nested {
            value = value.get(*field)?.get(nested_key)?;
        }
        value.as_object().cloned()
    }

    pub fn get_str(&self, key: &StateKey, field: &str) -> Option<String> {
        self.get(key)?.get(field)?.as_str().map(str::to_string)
    }

    /// Full document for persistence.
    pub fn document(&self) -> Value {
        Value::Object(self.read().clone())
    }

    /// Externally visible state, optionally restricted to some top-level
    /// sections. Adds a derived `network` section summarising node stats.
    pub fn view(&self, include: &[String]) -> Value {
        let doc = self.read();
        let mut out = Map::new();
        for category in Category::ALL {
            let section = doc.get(category.as_str()).cloned().unwrap_or_else(|| json!({}));
            out.insert(category.as_str().to_string(), section);
        }
        out.insert("network".to_string(), network_summary(&doc));
        drop(doc);

        if !include.is_empty() {
            out.retain(|name, _| include.iter().any(|i| i == name));
        }
        Value::Object(out)
    }
}

/// Sum numeric node stats across all nodes.
fn network_summary(doc: &Map<String, Value>) -> Value {
    let mut node_count = 0u64;
    let mut totals: Map<String, Value> = Map::new();
    if let Some(nodes) = doc.get(Category::ApplicationNode.as_str()).and_then(Value::as_object) {
        for node in nodes.values() {
            node_count += 1;
            let Some(stats) = node.get("stats").and_then(Value::as_object) else {
                continue;
            };
            for (name, value) in stats {
                if let Some(n) = value.as_f64() {
                    let sum = totals.get(name).and_then(Value::as_f64).unwrap_or(0.0) + n;
                    totals.insert(name.clone(), json!(sum));
                }
            }
        }
    }
    json!({ "nodeCount": node_count, "nodeStats": totals })
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            match other {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        }
    }
}

fn entry_mut<'a>(doc: &'a mut Map<String, Value>, key: &StateKey) -> &'a mut Map<String, Value> {
    let section = ensure_object(
        doc.entry(key.category.as_str())
            .or_insert_with(|| Value::Object(Map::new())),
    );
    let target = ensure_object(
        section
            .entry(key.target.clone())
            .or_insert_with(|| Value::Object(Map::new())),
    );
    match &key.nested {
        None => target,
        Some((field, nested_key)) => {
            let nested = ensure_object(
                target
                    .entry(field.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
            );
            ensure_object(
                nested
                    .entry(nested_key.clone())
                    .or_insert_with(|| Value::Object(Map::new())),
            )
        }
    }
}

/// Persist the state document on a fixed interval until stopped.
pub fn spawn_persist_loop(
    state: Arc<StateStore>,
    store: Arc<Store>,
    every: Duration,
    mut stop: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick fires immediately; nothing new to write yet
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    persist(&state, &store);
                    break;
                }
                _ = interval.tick() => persist(&state, &store),
            }
        }
    })
}

fn persist(state: &StateStore, store: &Store) {
    if let Err(e) = store.save_state(&state.document()) {
        tracing::error!("Failed to persist health state: {}", e);
    }
}
