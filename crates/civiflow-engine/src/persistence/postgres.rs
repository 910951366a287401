//! PostgreSQL implementation of InstanceStore
//!
//! Whole-instance persistence: context and task states are stored as
//! JSONB columns and upserted atomically per save, which gives the
//! per-instance write serialization the engine relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use civiflow_core::instance::Instance;

use super::store::*;

/// PostgreSQL implementation of [`InstanceStore`]
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use civiflow_engine::PostgresInstanceStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/civiflow").await?;
/// let store = PostgresInstanceStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS civiflow_instances (
                id UUID PRIMARY KEY,
                dag_id TEXT NOT NULL,
                owner_user_id TEXT NOT NULL,
                tenant TEXT,
                status TEXT NOT NULL,
                context JSONB NOT NULL,
                task_states JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                parent_instance_id UUID,
                triggering_event JSONB,
                hook_depth INT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_civiflow_instances_status
                ON civiflow_instances (status, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_civiflow_instances_dag
                ON civiflow_instances (dag_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS civiflow_dag_registrations (
                dag_id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                workflow_type TEXT NOT NULL,
                task_count INT NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_instance(row: &sqlx::postgres::PgRow) -> Result<Instance, StoreError> {
        let status_str: String = row.get("status");
        let status = status_str
            .parse()
            .map_err(StoreError::Serialization)?;

        let context: serde_json::Value = row.get("context");
        let context = serde_json::from_value(context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let task_states: serde_json::Value = row.get("task_states");
        let task_states = serde_json::from_value(task_states)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let triggering_event: Option<serde_json::Value> = row.get("triggering_event");
        let triggering_event = triggering_event
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let hook_depth: i32 = row.get("hook_depth");

        Ok(Instance {
            instance_id: row.get("id"),
            dag_id: row.get("dag_id"),
            owner_user_id: row.get("owner_user_id"),
            tenant: row.get("tenant"),
            status,
            context,
            task_states,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            parent_instance_id: row.get("parent_instance_id"),
            triggering_event,
            hook_depth: hook_depth as u32,
        })
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    async fn save_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        let context = serde_json::to_value(&instance.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let task_states = serde_json::to_value(&instance.task_states)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let triggering_event = instance
            .triggering_event
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO civiflow_instances
                (id, dag_id, owner_user_id, tenant, status, context, task_states,
                 created_at, started_at, completed_at, parent_instance_id,
                 triggering_event, hook_depth)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                context = EXCLUDED.context,
                task_states = EXCLUDED.task_states,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(instance.instance_id)
        .bind(&instance.dag_id)
        .bind(&instance.owner_user_id)
        .bind(&instance.tenant)
        .bind(instance.status.to_string())
        .bind(&context)
        .bind(&task_states)
        .bind(instance.created_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .bind(instance.parent_instance_id)
        .bind(&triggering_event)
        .bind(instance.hook_depth as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!("saved instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_instance(&self, instance_id: Uuid) -> Result<Instance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, dag_id, owner_user_id, tenant, status, context, task_states,
                   created_at, started_at, completed_at, parent_instance_id,
                   triggering_event, hook_depth
            FROM civiflow_instances
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load instance: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        Self::row_to_instance(&row)
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        filter: InstanceFilter,
        page: Pagination,
    ) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, dag_id, owner_user_id, tenant, status, context, task_states,
                   created_at, started_at, completed_at, parent_instance_id,
                   triggering_event, hook_depth
            FROM civiflow_instances
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR dag_id = $2)
              AND ($3::text IS NULL OR owner_user_id = $3)
            ORDER BY created_at DESC
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.dag_id)
        .bind(filter.owner_user_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    #[instrument(skip(self, registration), fields(dag_id = %registration.dag_id))]
    async fn save_dag_registration(
        &self,
        registration: &DagRegistration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO civiflow_dag_registrations
                (dag_id, description, workflow_type, task_count, registered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dag_id) DO UPDATE SET
                description = EXCLUDED.description,
                workflow_type = EXCLUDED.workflow_type,
                task_count = EXCLUDED.task_count,
                registered_at = EXCLUDED.registered_at
            "#,
        )
        .bind(&registration.dag_id)
        .bind(&registration.description)
        .bind(&registration.workflow_type)
        .bind(registration.task_count as i32)
        .bind(registration.registered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_dag_registrations(&self) -> Result<Vec<DagRegistration>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT dag_id, description, workflow_type, task_count, registered_at
            FROM civiflow_dag_registrations
            ORDER BY dag_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| DagRegistration {
                dag_id: row.get("dag_id"),
                description: row.get("description"),
                workflow_type: row.get("workflow_type"),
                task_count: row.get::<i32, _>("task_count") as u32,
                registered_at: row.get("registered_at"),
            })
            .collect())
    }
}
