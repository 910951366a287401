//! InstanceStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use civiflow_core::instance::{Instance, InstanceStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub dag_id: Option<String>,
    pub owner_user_id: Option<String>,
}

impl InstanceFilter {
    /// Filter by status only
    pub fn by_status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Filter by DAG id only
    pub fn by_dag(dag_id: impl Into<String>) -> Self {
        Self {
            dag_id: Some(dag_id.into()),
            ..Default::default()
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Informational record of a registered DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRegistration {
    pub dag_id: String,
    pub description: String,
    pub workflow_type: String,
    pub task_count: u32,
    pub registered_at: DateTime<Utc>,
}

/// Durable store for workflow instances
///
/// Implementations must be thread-safe and may batch or debounce writes,
/// but must guarantee the durability rule in the module docs.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    /// Persist the full post-transition state of an instance
    async fn save_instance(&self, instance: &Instance) -> Result<(), StoreError>;

    /// Load an instance by id
    async fn load_instance(&self, instance_id: Uuid) -> Result<Instance, StoreError>;

    /// List instances matching a filter, newest first
    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<Instance>, StoreError>;

    /// Record a DAG registration (informational listing only)
    async fn save_dag_registration(
        &self,
        registration: &DagRegistration,
    ) -> Result<(), StoreError>;

    /// List recorded DAG registrations
    async fn list_dag_registrations(&self) -> Result<Vec<DagRegistration>, StoreError>;
}
