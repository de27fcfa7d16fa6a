use crate::{NodeError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Identifier of one unit of data, e.g. `visit=12345 ccd=1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(BTreeMap<String, String>);

impl DataId {
    /// The id used for whole-store entries such as persisted configs.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for DataId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = DataId::empty();
        for pair in s.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                NodeError::Configuration(format!("data id component '{}' is not key=value", pair))
            })?;
            if key.is_empty() {
                return Err(NodeError::Configuration(format!(
                    "data id component '{}' has an empty key",
                    pair
                )));
            }
            id.0.insert(key.to_string(), value.to_string());
        }
        Ok(id)
    }
}

/// One invocation target for the batch runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub data_id: DataId,
    #[serde(default)]
    pub kwargs: HashMap<String, Value>,
}

impl Target {
    pub fn new(data_id: DataId) -> Self {
        Self {
            data_id,
            kwargs: HashMap::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

impl From<DataId> for Target {
    fn from(data_id: DataId) -> Self {
        Target::new(data_id)
    }
}
