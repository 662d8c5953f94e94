//! Schema migrations for the persisted state document.
//!
//! Each migration is a pure, idempotent function over the document. They run
//! in order on every load, so a document at any past version converges on the
//! current schema.

use serde_json::{Map, Value};

use super::Category;

pub const CURRENT_VERSION: u64 = 4;

type Migration = fn(&mut Map<String, Value>);

const MIGRATIONS: &[(u64, &str, Migration)] = &[
    (1, "ensure category sections", ensure_category_sections),
    (2, "collapse legacy outcome arrays", collapse_outcome_arrays),
    (3, "drop fetch history", drop_fetch_history),
    (4, "peer lists to peer counts", peer_lists_to_counts),
];

/// Legacy peer list fields and the count fields that replace them.
const PEER_LISTS: &[(&str, &str)] = &[
    ("pubsubPeers", "pubsubPeerCount"),
    ("pubsubDhtPeers", "pubsubDhtPeerCount"),
    ("pubsubRouterPeers", "pubsubRouterPeerCount"),
];

/// Bring a persisted document up to the current schema. Anything that is not
/// a JSON object is discarded and replaced by an empty document.
pub fn migrate(doc: Value) -> Map<String, Value> {
    let mut doc = match doc {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            tracing::warn!("Discarding malformed state document of type {}", type_name(&other));
            Map::new()
        }
    };

    let from = doc.get("version").and_then(Value::as_u64).unwrap_or(0);
    for (version, name, migration) in MIGRATIONS {
        migration(&mut doc);
        if *version > from {
            tracing::debug!("Applied state migration {}: {}", version, name);
        }
    }
    doc.insert("version".to_string(), Value::from(CURRENT_VERSION));
    doc
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn sections_mut(doc: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    doc.iter_mut().filter_map(|(name, value)| {
        if name.parse::<Category>().is_ok() {
            value.as_object_mut()
        } else {
            None
        }
    })
}

fn ensure_category_sections(doc: &mut Map<String, Value>) {
    for category in Category::ALL {
        let section = doc
            .entry(category.as_str())
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
    }
}

/// Older documents kept a list of outcomes per target. Keep only the latest.
fn collapse_outcome_arrays(doc: &mut Map<String, Value>) {
    for section in sections_mut(doc) {
        for entry in section.values_mut() {
            if let Value::Array(items) = entry {
                let latest = items
                    .iter()
                    .rev()
                    .find(|item| item.is_object())
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                *entry = latest;
            }
        }
    }
}

fn drop_fetch_history(doc: &mut Map<String, Value>) {
    for section in sections_mut(doc) {
        for entry in section.values_mut() {
            if let Some(entry) = entry.as_object_mut() {
                entry.remove("fetchHistory");
            }
        }
    }
}

fn peer_lists_to_counts(doc: &mut Map<String, Value>) {
    let Some(nodes) = doc
        .get_mut(Category::ApplicationNode.as_str())
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for entry in nodes.values_mut() {
        let Some(entry) = entry.as_object_mut() else {
            continue;
        };
        for (list, count) in PEER_LISTS {
            if let Some(Value::Array(peers)) = entry.remove(*list) {
                entry
                    .entry(count.to_string())
                    .or_insert_with(|| Value::from(peers.len()));
            }
        }
    }
}
