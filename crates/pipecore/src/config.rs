use crate::NodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Configuration object attached to a node.
///
/// The engine never interprets its contents; it only merges overrides into
/// factory defaults and compares a configuration against a persisted one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskConfig(Map<String, Json>);

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: Json) -> Result<Self, NodeError> {
        match json {
            Json::Object(map) => Ok(Self(map)),
            Json::Null => Ok(Self::default()),
            other => Err(NodeError::Configuration(format!(
                "config must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Json::as_f64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Json::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Json::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Json::as_bool)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Json {
        Json::Object(self.0.clone())
    }

    /// Returns `self` with `overrides` applied on top; nested objects merge key by key.
    pub fn merged(&self, overrides: &TaskConfig) -> TaskConfig {
        let mut map = self.0.clone();
        merge_into(&mut map, &overrides.0);
        TaskConfig(map)
    }

    /// Apply a `dotted.key=value` override. The value is parsed as JSON and
    /// falls back to a plain string.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), NodeError> {
        let (path, raw) = assignment.split_once('=').ok_or_else(|| {
            NodeError::Configuration(format!("expected key=value, got '{}'", assignment))
        })?;
        let path = path.trim();
        if path.is_empty() {
            return Err(NodeError::Configuration(format!(
                "empty key in override '{}'",
                assignment
            )));
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Json::String(raw.trim().to_string()));

        let mut keys: Vec<&str> = path.split('.').collect();
        let last = keys.pop().unwrap_or(path);
        let mut map = &mut self.0;
        for key in keys {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Json::Object(Map::new()));
            if !entry.is_object() {
                *entry = Json::Object(Map::new());
            }
            map = match entry {
                Json::Object(inner) => inner,
                _ => unreachable!("entry was just made an object"),
            };
        }
        map.insert(last.to_string(), value);
        Ok(())
    }

    /// Human-readable differences between `self` and a previously persisted config.
    pub fn diff(&self, persisted: &TaskConfig) -> Vec<String> {
        let mut out = Vec::new();
        diff_maps("", &self.0, &persisted.0, &mut out);
        out
    }
}

fn merge_into(base: &mut Map<String, Json>, overrides: &Map<String, Json>) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Json::Object(existing)), Json::Object(incoming)) => {
                merge_into(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn diff_maps(prefix: &str, current: &Map<String, Json>, old: &Map<String, Json>, out: &mut Vec<String>) {
    for (key, value) in current {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match (old.get(key), value) {
            (None, _) => out.push(format!("{}: new value {} not in persisted config", path, value)),
            (Some(Json::Object(a)), Json::Object(b)) => diff_maps(&path, b, a, out),
            (Some(previous), _) if previous != value => {
                out.push(format!("{}: {} != {}", path, value, previous))
            }
            _ => {}
        }
    }
    for key in old.keys().filter(|k| !current.contains_key(*k)) {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        out.push(format!("{}: missing from current config", path));
    }
}
