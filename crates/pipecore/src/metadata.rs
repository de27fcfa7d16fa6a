use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hierarchical key/value metadata recorded while a node runs.
///
/// Keys are dotted paths (`run.duration_ms`). Ordering is stable so that
/// serialized metadata diffs cleanly between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every entry of `other` under `prefix.`.
    pub fn extend_prefixed(&mut self, prefix: &str, other: &Metadata) {
        for (key, value) in &other.0 {
            self.0.insert(format!("{}.{}", prefix, key), value.clone());
        }
    }

    /// Entries whose key lies under `prefix.`, with the prefix stripped.
    pub fn subtree(&self, prefix: &str) -> Metadata {
        let lead = format!("{}.", prefix);
        Metadata(
            self.0
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&lead).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        )
    }
}
