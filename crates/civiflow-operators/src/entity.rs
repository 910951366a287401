//! Entity CRUD base shapes
//!
//! Instances produce durable entities (property records, permits,
//! licenses) through an external entity store. These operators cover the
//! create/update shapes and emit `ENTITY_CREATED.<type>` /
//! `ENTITY_UPDATED.<type>` events for hook-linked workflows.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use civiflow_core::event;
use civiflow_core::operator::{Operator, TaskContext, TaskResult};

/// A stored entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub owner_user_id: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// External entity store consumed by the entity operators
///
/// The document store behind it is an external collaborator; only this
/// interface is part of the engine's world.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Persist a new entity
    async fn create_entity(&self, record: EntityRecord) -> anyhow::Result<()>;

    /// Merge a patch into an existing entity, returning the updated record
    async fn update_entity(
        &self,
        entity_id: &str,
        patch: Map<String, Value>,
    ) -> anyhow::Result<EntityRecord>;

    /// Fetch an entity by id
    async fn get_entity(&self, entity_id: &str) -> anyhow::Result<Option<EntityRecord>>;
}

/// In-memory entity store for tests
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<HashMap<String, EntityRecord>>,
}

impl InMemoryEntityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn create_entity(&self, record: EntityRecord) -> anyhow::Result<()> {
        self.entities
            .write()
            .insert(record.entity_id.clone(), record);
        Ok(())
    }

    async fn update_entity(
        &self,
        entity_id: &str,
        patch: Map<String, Value>,
    ) -> anyhow::Result<EntityRecord> {
        let mut entities = self.entities.write();
        let record = entities
            .get_mut(entity_id)
            .ok_or_else(|| anyhow::anyhow!("entity not found: {entity_id}"))?;
        for (key, value) in patch {
            record.data.insert(key, value);
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn get_entity(&self, entity_id: &str) -> anyhow::Result<Option<EntityRecord>> {
        Ok(self.entities.read().get(entity_id).cloned())
    }
}

/// Creates an entity from collected context data
///
/// Reads the entity payload from a context dot-path (typically an
/// upstream task's `"{task_id}_data"` output), writes it to the entity
/// store, and publishes `"{task_id}_entity_id"`.
pub struct CreateEntityOperator {
    task_id: String,
    entity_type: String,
    source_key: String,
    store: Arc<dyn EntityStore>,
    fail_on_missing: bool,
}

impl CreateEntityOperator {
    /// Create an entity-creation operator reading from `source_key`
    pub fn new(
        task_id: impl Into<String>,
        entity_type: impl Into<String>,
        source_key: impl Into<String>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            entity_type: entity_type.into(),
            source_key: source_key.into(),
            store,
            fail_on_missing: true,
        }
    }

    /// Retry instead of failing when the source data is absent
    pub fn retry_on_missing(mut self) -> Self {
        self.fail_on_missing = false;
        self
    }
}

#[async_trait]
impl Operator for CreateEntityOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "create_entity"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let Some(data) = ctx.get_path(&self.source_key).and_then(Value::as_object).cloned()
        else {
            let error = format!("no entity data at '{}'", self.source_key);
            return if self.fail_on_missing {
                TaskResult::failed(error)
            } else {
                TaskResult::retry(error)
            };
        };

        let owner = ctx
            .get("owner_user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let now = Utc::now();
        let record = EntityRecord {
            entity_id: Uuid::now_v7().to_string(),
            entity_type: self.entity_type.clone(),
            owner_user_id: owner.clone(),
            data,
            created_at: now,
            updated_at: now,
        };
        let entity_id = record.entity_id.clone();

        if let Err(error) = self.store.create_entity(record).await {
            return TaskResult::retry(format!("entity store write failed: {error}"));
        }

        let mut payload = Map::new();
        payload.insert("entity_id".to_string(), Value::String(entity_id.clone()));
        payload.insert(
            "entity_type".to_string(),
            Value::String(self.entity_type.clone()),
        );
        payload.insert("owner_user_id".to_string(), Value::String(owner));
        ctx.emit_event(event::entity_created(&self.entity_type), payload);
        ctx.log_info("entity created", None);

        let mut output = Map::new();
        output.insert(
            format!("{}_entity_id", self.task_id),
            Value::String(entity_id),
        );
        output.insert(
            format!("{}_entity_type", self.task_id),
            Value::String(self.entity_type.clone()),
        );
        TaskResult::done(output)
    }
}

/// Applies a patch to an existing entity
pub struct UpdateEntityOperator {
    task_id: String,
    entity_type: String,
    entity_id_key: String,
    patch_key: String,
    store: Arc<dyn EntityStore>,
}

impl UpdateEntityOperator {
    /// Create an entity-update operator
    ///
    /// `entity_id_key` and `patch_key` are context dot-paths naming the
    /// target entity and the fields to merge.
    pub fn new(
        task_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id_key: impl Into<String>,
        patch_key: impl Into<String>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            entity_type: entity_type.into(),
            entity_id_key: entity_id_key.into(),
            patch_key: patch_key.into(),
            store,
        }
    }
}

#[async_trait]
impl Operator for UpdateEntityOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "update_entity"
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let Some(entity_id) = ctx
            .get_path(&self.entity_id_key)
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return TaskResult::failed(format!("no entity id at '{}'", self.entity_id_key));
        };
        let Some(patch) = ctx.get_path(&self.patch_key).and_then(Value::as_object).cloned()
        else {
            return TaskResult::failed(format!("no patch data at '{}'", self.patch_key));
        };

        match self.store.update_entity(&entity_id, patch).await {
            Ok(record) => {
                let mut payload = Map::new();
                payload.insert("entity_id".to_string(), Value::String(entity_id.clone()));
                payload.insert(
                    "entity_type".to_string(),
                    Value::String(record.entity_type.clone()),
                );
                ctx.emit_event(event::entity_updated(&self.entity_type), payload);

                let mut output = Map::new();
                output.insert(format!("{}_updated", self.task_id), Value::Bool(true));
                output.insert(
                    format!("{}_entity_id", self.task_id),
                    Value::String(entity_id),
                );
                TaskResult::done(output)
            }
            Err(error) => TaskResult::retry(format!("entity store update failed: {error}")),
        }
    }
}
