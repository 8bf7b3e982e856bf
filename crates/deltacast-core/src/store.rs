//! Topic schemas and the mutable record instances under them.

use std::collections::HashMap;

use deltacast_proto::{FieldMap, InstanceMap, Shape};
use uuid::Uuid;

use crate::error::ContractError;

/// One topic: its immutable shape plus the records instanced under it.
#[derive(Debug, Clone)]
struct TopicStorage {
    shape: Shape,
    instances: InstanceMap,
}

/// Owns every schema and instance in the broker.
///
/// The store is plain data: callers (the router) serialize access behind
/// their own lock. Schemas are created exactly once per topic and never
/// deleted; instances are created and mutated but never deleted.
#[derive(Debug, Clone, Default)]
pub struct SchemaStore {
    topics: HashMap<String, TopicStorage>,
}

impl SchemaStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for `topic`. First writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::SchemaExists`] if the topic already has
    /// a schema; the original shape is retained.
    pub fn create_schema(&mut self, topic: &str, shape: Shape) -> Result<(), ContractError> {
        if self.topics.contains_key(topic) {
            return Err(ContractError::SchemaExists(topic.to_string()));
        }
        tracing::info!(topic, "Schema created");
        self.topics.insert(
            topic.to_string(),
            TopicStorage {
                shape,
                instances: InstanceMap::new(),
            },
        );
        Ok(())
    }

    /// The shape registered for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::SchemaNotFound`] if the topic is unknown.
    pub fn schema(&self, topic: &str) -> Result<&Shape, ContractError> {
        self.topics
            .get(topic)
            .map(|storage| &storage.shape)
            .ok_or_else(|| ContractError::SchemaNotFound(topic.to_string()))
    }

    /// Mint a fresh, empty instance under `topic` and return its id.
    ///
    /// Ids are random UUIDs, regenerated on the off chance of a
    /// collision, so the returned id is never one already present in
    /// the topic. Clients treat ids as opaque strings.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::SchemaNotFound`] if the topic is unknown.
    pub fn create_instance(&mut self, topic: &str) -> Result<String, ContractError> {
        let storage = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| ContractError::SchemaNotFound(topic.to_string()))?;

        let mut id = Uuid::new_v4().to_string();
        while storage.instances.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        storage.instances.insert(id.clone(), FieldMap::new());
        tracing::info!(topic, %id, "Instance created");
        Ok(id)
    }

    /// A snapshot of every instance under `topic`, keyed by id.
    ///
    /// A topic with no instances yields an empty map, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::SchemaNotFound`] if the topic is unknown.
    pub fn list_instances(&self, topic: &str) -> Result<InstanceMap, ContractError> {
        self.topics
            .get(topic)
            .map(|storage| storage.instances.clone())
            .ok_or_else(|| ContractError::SchemaNotFound(topic.to_string()))
    }

    /// Apply `change` to one instance and return the delta that should
    /// propagate.
    ///
    /// Each proposed field is compared to the stored value: fields that
    /// differ are written and kept in the delta, fields that are already
    /// equal are dropped from it. The returned delta is exactly the
    /// subset of fields that changed, and may be empty.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::SchemaNotFound`] for an unknown topic
    /// and [`ContractError::InstanceNotFound`] for an unknown instance;
    /// in both cases nothing is written.
    pub fn apply_mutation(
        &mut self,
        topic: &str,
        id: &str,
        change: FieldMap,
    ) -> Result<FieldMap, ContractError> {
        let storage = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| ContractError::SchemaNotFound(topic.to_string()))?;
        let record = storage
            .instances
            .get_mut(id)
            .ok_or_else(|| ContractError::InstanceNotFound {
                topic: topic.to_string(),
                id: id.to_string(),
            })?;

        let mut delta = FieldMap::new();
        for (field, value) in change {
            if record.get(&field) != Some(&value) {
                record.insert(field.clone(), value.clone());
                delta.insert(field, value);
            }
        }
        Ok(delta)
    }
}
