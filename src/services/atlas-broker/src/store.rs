//! Persisted instance metadata
//!
//! The broker remembers, per service instance, the tenant (`groupID`) it was
//! provisioned into and the backend cluster name (`clusterName`). Instances
//! without a record are new; that is not an error.

use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, UpdateOptions};
use mongodb::{Client, Collection};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Metadata key holding the tenant ID
pub const GROUP_ID_KEY: &str = "groupID";

/// Metadata key holding the backend cluster name
pub const CLUSTER_NAME_KEY: &str = "clusterName";

/// Free-form metadata recorded for an instance
pub type InstanceMetadata = Map<String, Value>;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Metadata of an instance, `None` when nothing was recorded
    async fn instance_metadata(&self, instance_id: &str) -> Result<Option<InstanceMetadata>>;

    /// Merge `metadata` into the record of an instance, creating it if needed
    async fn save_instance_metadata(
        &self,
        instance_id: &str,
        metadata: InstanceMetadata,
    ) -> Result<()>;
}

/// Read a string entry, failing when it is absent or not a string
pub fn required_string(
    instance_id: &str,
    metadata: &InstanceMetadata,
    key: &str,
) -> Result<String> {
    match metadata.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(BrokerError::instance_metadata(
            instance_id,
            format!("{} has the wrong type: {}", key, other),
        )),
        None => Err(BrokerError::instance_metadata(
            instance_id,
            format!("{} not found in instance metadata", key),
        )),
    }
}

/// Instance records stored in a MongoDB collection.
///
/// Documents look like `{ "id": <instance id>, "parameters": { ... } }`.
#[derive(Debug, Clone)]
pub struct MongoInstanceStore {
    collection: Collection<Document>,
}

impl MongoInstanceStore {
    pub async fn connect(url: &str, database: &str, collection: &str) -> Result<Self> {
        info!("Connecting instance store to MongoDB database {}", database);

        let options = ClientOptions::parse(url).await?;
        let client = Client::with_options(options)?;
        Ok(Self::from_client(&client, database, collection))
    }

    pub fn from_client(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }
}

#[async_trait]
impl InstanceStore for MongoInstanceStore {
    async fn instance_metadata(&self, instance_id: &str) -> Result<Option<InstanceMetadata>> {
        let filter = doc! { "id": instance_id };
        let document = match self.collection.find_one(filter, None).await? {
            Some(document) => document,
            None => {
                debug!(instance_id, "No stored metadata for instance");
                return Ok(None);
            }
        };

        match document.get("parameters") {
            Some(Bson::Document(parameters)) => {
                match Bson::Document(parameters.clone()).into_relaxed_extjson() {
                    Value::Object(map) => Ok(Some(map)),
                    _ => Ok(Some(Map::new())),
                }
            }
            Some(other) => Err(BrokerError::instance_metadata(
                instance_id,
                format!("instance metadata has the wrong type {:?}", other.element_type()),
            )),
            None => Ok(Some(Map::new())),
        }
    }

    async fn save_instance_metadata(
        &self,
        instance_id: &str,
        metadata: InstanceMetadata,
    ) -> Result<()> {
        let mut set = doc! { "id": instance_id };
        for (key, value) in metadata {
            set.insert(format!("parameters.{}", key), mongodb::bson::to_bson(&value)?);
        }

        let options = UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(doc! { "id": instance_id }, doc! { "$set": set }, options)
            .await?;

        debug!(instance_id, "Saved instance metadata");
        Ok(())
    }
}

/// Process-local store, used in tests and when no database is configured
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<String, InstanceMetadata>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, instance_id: impl Into<String>, metadata: InstanceMetadata) -> Self {
        self.instances.insert(instance_id.into(), metadata);
        self
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn instance_metadata(&self, instance_id: &str) -> Result<Option<InstanceMetadata>> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save_instance_metadata(
        &self,
        instance_id: &str,
        metadata: InstanceMetadata,
    ) -> Result<()> {
        self.instances
            .entry(instance_id.to_string())
            .or_default()
            .extend(metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> InstanceMetadata {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_store_merges() {
        let store = InMemoryInstanceStore::new();
        assert!(store.instance_metadata("i-1").await.unwrap().is_none());

        store
            .save_instance_metadata("i-1", metadata(json!({"groupID": "p1"})))
            .await
            .unwrap();
        store
            .save_instance_metadata("i-1", metadata(json!({"clusterName": "c1"})))
            .await
            .unwrap();

        let stored = store.instance_metadata("i-1").await.unwrap().unwrap();
        assert_eq!(stored, metadata(json!({"groupID": "p1", "clusterName": "c1"})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_required_string() {
        let stored = metadata(json!({"groupID": "p1", "clusterName": 7}));
        assert_eq!(required_string("i", &stored, GROUP_ID_KEY).unwrap(), "p1");
        assert!(matches!(
            required_string("i", &stored, CLUSTER_NAME_KEY),
            Err(BrokerError::InvalidInstanceMetadata { .. })
        ));
        assert!(matches!(
            required_string("i", &Map::new(), GROUP_ID_KEY),
            Err(BrokerError::InvalidInstanceMetadata { .. })
        ));
    }
}
