//! In-memory implementation of InstanceStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use civiflow_core::instance::Instance;

use super::store::*;

/// In-memory implementation of [`InstanceStore`]
///
/// Primarily for testing. Stores full instance snapshots in memory with
/// the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use civiflow_engine::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// ```
pub struct InMemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, Instance>>,
    registrations: RwLock<Vec<DagRegistration>>,
}

impl InMemoryInstanceStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.registrations.write().clear();
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.instances
            .write()
            .insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Instance, StoreError> {
        self.instances
            .read()
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<Instance>, StoreError> {
        let instances = self.instances.read();
        let mut matched: Vec<Instance> = instances
            .values()
            .filter(|i| {
                if let Some(status) = filter.status {
                    if i.status != status {
                        return false;
                    }
                }
                if let Some(ref dag_id) = filter.dag_id {
                    if &i.dag_id != dag_id {
                        return false;
                    }
                }
                if let Some(ref owner) = filter.owner_user_id {
                    if &i.owner_user_id != owner {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn save_dag_registration(
        &self,
        registration: &DagRegistration,
    ) -> Result<(), StoreError> {
        let mut registrations = self.registrations.write();
        registrations.retain(|r| r.dag_id != registration.dag_id);
        registrations.push(registration.clone());
        Ok(())
    }

    async fn list_dag_registrations(&self) -> Result<Vec<DagRegistration>, StoreError> {
        Ok(self.registrations.read().clone())
    }
}
