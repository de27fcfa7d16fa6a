use crate::{DataId, Metadata, StoreError, TaskConfig, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Data access collaborator: fetches and persists opaque payloads by dataset
/// name and data id.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, dataset: &str, data_id: &DataId) -> Result<Option<Value>, StoreError>;

    async fn put(&self, dataset: &str, data_id: &DataId, value: Value) -> Result<(), StoreError>;

    async fn exists(&self, dataset: &str, data_id: &DataId) -> Result<bool, StoreError> {
        Ok(self.get(dataset, data_id).await?.is_some())
    }

    /// Load a persisted configuration stored under `DataId::empty()`.
    async fn get_config(&self, name: &str) -> Result<Option<TaskConfig>, StoreError> {
        match self.get(name, &DataId::empty()).await? {
            Some(Value::Json(json)) => TaskConfig::from_json(json)
                .map(Some)
                .map_err(|e| StoreError::Invalid(e.to_string())),
            Some(other) => Err(StoreError::Invalid(format!(
                "persisted config '{}' is not JSON: {:?}",
                name, other
            ))),
            None => Ok(None),
        }
    }

    async fn put_config(&self, name: &str, config: &TaskConfig) -> Result<(), StoreError> {
        self.put(name, &DataId::empty(), Value::Json(config.to_json()))
            .await
    }
}

/// Receives the metadata of every batch invocation, failed or not.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn write(&self, name: &str, data_id: &DataId, metadata: &Metadata) -> Result<(), StoreError>;
}

/// In-process store implementing both collaborator traits.
#[derive(Default)]
pub struct MemoryStore {
    datasets: RwLock<HashMap<String, HashMap<DataId, Value>>>,
    metadata: RwLock<HashMap<String, HashMap<DataId, Metadata>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `{ "dataset": { "key=value ...": <json> } }`.
    pub fn from_json(json: serde_json::Value) -> Result<Self, StoreError> {
        let serde_json::Value::Object(datasets) = json else {
            return Err(StoreError::Invalid("expected an object of datasets".to_string()));
        };

        let mut loaded = HashMap::new();
        for (dataset, entries) in datasets {
            let serde_json::Value::Object(entries) = entries else {
                return Err(StoreError::Invalid(format!(
                    "dataset '{}' must map data ids to values",
                    dataset
                )));
            };
            let mut by_id = HashMap::new();
            for (raw_id, value) in entries {
                let data_id: DataId = raw_id
                    .parse()
                    .map_err(|e: crate::NodeError| StoreError::Invalid(e.to_string()))?;
                by_id.insert(data_id, Value::from_plain_json(value));
            }
            loaded.insert(dataset, by_id);
        }

        Ok(Self {
            datasets: RwLock::new(loaded),
            metadata: RwLock::new(HashMap::new()),
        })
    }

    pub async fn metadata_for(&self, name: &str, data_id: &DataId) -> Option<Metadata> {
        self.metadata
            .read()
            .await
            .get(name)
            .and_then(|m| m.get(data_id))
            .cloned()
    }

    pub async fn metadata_count(&self, name: &str) -> usize {
        self.metadata.read().await.get(name).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, dataset: &str, data_id: &DataId) -> Result<Option<Value>, StoreError> {
        Ok(self
            .datasets
            .read()
            .await
            .get(dataset)
            .and_then(|entries| entries.get(data_id))
            .cloned())
    }

    async fn put(&self, dataset: &str, data_id: &DataId, value: Value) -> Result<(), StoreError> {
        self.datasets
            .write()
            .await
            .entry(dataset.to_string())
            .or_default()
            .insert(data_id.clone(), value);
        Ok(())
    }
}

#[async_trait]
impl MetadataSink for MemoryStore {
    async fn write(&self, name: &str, data_id: &DataId, metadata: &Metadata) -> Result<(), StoreError> {
        self.metadata
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(data_id.clone(), metadata.clone());
        Ok(())
    }
}
