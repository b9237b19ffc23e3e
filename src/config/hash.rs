//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of documents and attribute
//! maps to detect changes between applies and enable idempotent operations.
//! Object keys are fed in sorted order so the hash does not depend on map
//! iteration order.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::graph::{Attributes, ResourceGraph};

use super::spec::DesiredDocument;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole document.
    ///
    /// This hash changes when any resource, variable or project field
    /// changes. Executor and state settings are excluded.
    #[must_use]
    pub fn hash_document(&self, document: &DesiredDocument) -> String {
        let mut hasher = Sha256::new();

        hasher.update(document.project.name.as_bytes());
        hasher.update(document.project.environment.as_bytes());
        if let Some(region) = &document.project.region {
            hasher.update(region.as_bytes());
        }

        for (name, value) in &document.variables {
            hasher.update(name.as_bytes());
            feed_value(&mut hasher, value);
        }

        for (id, spec) in &document.resources {
            hasher.update(id.as_bytes());
            hasher.update(spec.kind.as_str().as_bytes());
            for predecessor in &spec.after {
                hasher.update(predecessor.as_bytes());
            }
            hasher.update(self.hash_attributes(&spec.attributes).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the resolved graph nodes.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut hasher = Sha256::new();
        for &idx in graph.topological_order() {
            let node = graph.node(idx);
            hasher.update(node.id.as_bytes());
            hasher.update(node.kind.as_str().as_bytes());
            hasher.update(self.hash_attributes(&node.attributes).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            feed_value(&mut hasher, value);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Feeds a tagged, key-sorted encoding of `value` into `hasher`.
fn feed_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                feed_value(hasher, &map[key]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_attribute_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = attrs(json!({"family": "airflow", "cpu": 1024, "tags": {"b": 1, "a": 2}}));
        let b = attrs(json!({"tags": {"a": 2, "b": 1}, "cpu": 1024, "family": "airflow"}));

        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_different_values_different_hash() {
        let hasher = ConfigHasher::new();
        let a = attrs(json!({"network_mode": "awsvpc"}));
        let b = attrs(json!({"network_mode": "bridge"}));
        let c = attrs(json!({"network_mode": ["awsvpc"]}));

        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&c));
    }

    #[test]
    fn test_number_and_string_differ() {
        let hasher = ConfigHasher::new();
        let a = attrs(json!({"cpu": 1024}));
        let b = attrs(json!({"cpu": "1024"}));
        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_short_hash() {
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = ConfigHasher::short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
