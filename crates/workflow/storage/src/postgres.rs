//! PostgreSQL instance and definition store.
//!
//! The one-Active-per-key rule is a partial unique index, so it holds across
//! processes. CAS is a single `UPDATE ... WHERE id = $1 AND version = $2`.

use crate::traits::{ActiveKey, DefinitionStore, InstanceStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use workflow_types::{
    InstanceStatus, StepId, WorkflowDefinition, WorkflowDefinitionId, WorkflowError,
    WorkflowInstance, WorkflowInstanceId, WorkflowResult,
};

const INSTANCE_COLUMNS: &str = "id, definition_id, entity_type, entity_id, current_step, status, \
     version, visits, service_failures, next_retry_at, pending_audit, initiator, created_at, \
     updated_at";

/// PostgreSQL-backed workflow store.
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> WorkflowResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> WorkflowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| WorkflowError::Storage(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create the store from an existing pool.
    pub async fn from_pool(pool: PgPool) -> WorkflowResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> WorkflowResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                graph_json JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (name, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL REFERENCES workflow_definitions (id),
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                current_step TEXT,
                status TEXT NOT NULL,
                version BIGINT NOT NULL,
                visits JSONB NOT NULL,
                service_failures INTEGER NOT NULL,
                next_retry_at TIMESTAMPTZ,
                pending_audit JSONB,
                initiator TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS workflow_instances_one_active
                ON workflow_instances (definition_id, entity_type, entity_id)
                WHERE status = 'Active'
            "#,
            r#"
            ALTER TABLE workflow_instances ADD COLUMN IF NOT EXISTS pending_audit JSONB
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS workflow_instances_status_idx
                ON workflow_instances (status, created_at)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| WorkflowError::Storage(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn current_version(&self, id: &WorkflowInstanceId) -> WorkflowResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM workflow_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<i64, _>("version").map(|v| v as u64).map_err(backend))
            .transpose()
    }
}

#[async_trait]
impl InstanceStore for PostgresWorkflowStore {
    async fn create(&self, instance: WorkflowInstance) -> WorkflowResult<WorkflowInstance> {
        let key = ActiveKey::of(&instance);
        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, definition_id, entity_type, entity_id, current_step, status, version,
                 visits, service_failures, next_retry_at, pending_audit, initiator, created_at,
                 updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&instance.id.0)
        .bind(&instance.definition_id.0)
        .bind(&instance.entity_type)
        .bind(&instance.entity_id)
        .bind(instance.current_step.as_ref().map(|s| s.0.clone()))
        .bind(instance.status.as_str())
        .bind(to_i64(instance.version)?)
        .bind(visits_to_json(&instance.visits)?)
        .bind(instance.service_failures as i32)
        .bind(instance.next_retry_at)
        .bind(&instance.pending_audit)
        .bind(&instance.initiator)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &key))?;

        Ok(instance)
    }

    async fn load(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => row_to_instance(row),
            None => Err(WorkflowError::InstanceNotFound(id.clone())),
        }
    }

    async fn compare_and_swap(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        mut new_state: WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        let key = ActiveKey::of(&new_state);
        new_state.version = expected_version + 1;

        // Identity columns are part of the WHERE clause, so a state that tries
        // to move to another entity never matches.
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
               SET current_step = $6,
                   status = $7,
                   version = $8,
                   visits = $9,
                   service_failures = $10,
                   next_retry_at = $11,
                   pending_audit = $12,
                   updated_at = $13
             WHERE id = $1
               AND version = $2
               AND definition_id = $3
               AND entity_type = $4
               AND entity_id = $5
            "#,
        )
        .bind(&id.0)
        .bind(to_i64(expected_version)?)
        .bind(&new_state.definition_id.0)
        .bind(&new_state.entity_type)
        .bind(&new_state.entity_id)
        .bind(new_state.current_step.as_ref().map(|s| s.0.clone()))
        .bind(new_state.status.as_str())
        .bind(to_i64(new_state.version)?)
        .bind(visits_to_json(&new_state.visits)?)
        .bind(new_state.service_failures as i32)
        .bind(new_state.next_retry_at)
        .bind(&new_state.pending_audit)
        .bind(new_state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &key))?;

        if result.rows_affected() == 1 {
            return Ok(new_state);
        }

        match self.current_version(id).await? {
            None => Err(WorkflowError::InstanceNotFound(id.clone())),
            Some(actual) if actual != expected_version => Err(WorkflowError::VersionConflict {
                id: id.clone(),
                expected: expected_version,
                actual,
            }),
            Some(_) => Err(WorkflowError::Storage(format!(
                "instance {} cannot change its identity or entity key",
                id
            ))),
        }
    }

    async fn find_active(&self, key: &ActiveKey) -> WorkflowResult<Option<WorkflowInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE definition_id = $1 AND entity_type = $2 AND entity_id = $3 AND status = 'Active'"
        );
        let row = sqlx::query(&sql)
            .bind(&key.definition_id.0)
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(row_to_instance).transpose()
    }

    async fn list_by_status(&self, status: InstanceStatus) -> WorkflowResult<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE status = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(row_to_instance).collect()
    }

    async fn list_audit_pending(&self) -> WorkflowResult<Vec<WorkflowInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE pending_audit IS NOT NULL ORDER BY updated_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(row_to_instance).collect()
    }
}

#[async_trait]
impl DefinitionStore for PostgresWorkflowStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> WorkflowResult<()> {
        let graph = serde_json::to_value(definition)
            .map_err(|e| WorkflowError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, version, graph_json, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&definition.id.0)
        .bind(&definition.name)
        .bind(definition.version as i32)
        .bind(graph)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_definitions(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query(
            "SELECT graph_json FROM workflow_definitions ORDER BY name ASC, version ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let graph: serde_json::Value = row.try_get("graph_json").map_err(backend)?;
                serde_json::from_value(graph).map_err(|e| WorkflowError::Serialization(e.to_string()))
            })
            .collect()
    }
}

fn row_to_instance(row: PgRow) -> WorkflowResult<WorkflowInstance> {
    let id: String = row.try_get("id").map_err(backend)?;
    let definition_id: String = row.try_get("definition_id").map_err(backend)?;
    let current_step: Option<String> = row.try_get("current_step").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    let version: i64 = row.try_get("version").map_err(backend)?;
    let visits: serde_json::Value = row.try_get("visits").map_err(backend)?;
    let service_failures: i32 = row.try_get("service_failures").map_err(backend)?;
    let next_retry_at: Option<DateTime<Utc>> = row.try_get("next_retry_at").map_err(backend)?;

    Ok(WorkflowInstance {
        id: WorkflowInstanceId::new(id),
        definition_id: WorkflowDefinitionId::new(definition_id),
        entity_type: row.try_get("entity_type").map_err(backend)?,
        entity_id: row.try_get("entity_id").map_err(backend)?,
        current_step: current_step.map(StepId::new),
        status: status.parse::<InstanceStatus>()?,
        version: version as u64,
        visits: serde_json::from_value::<BTreeMap<StepId, u32>>(visits)
            .map_err(|e| WorkflowError::Serialization(e.to_string()))?,
        service_failures: service_failures as u32,
        next_retry_at,
        pending_audit: row.try_get("pending_audit").map_err(backend)?,
        initiator: row.try_get("initiator").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn visits_to_json(visits: &BTreeMap<StepId, u32>) -> WorkflowResult<serde_json::Value> {
    serde_json::to_value(visits).map_err(|e| WorkflowError::Serialization(e.to_string()))
}

fn map_unique_violation(err: sqlx::Error, key: &ActiveKey) -> WorkflowError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505")
            && db_err.constraint() == Some("workflow_instances_one_active")
        {
            return key.duplicate();
        }
    }
    backend(err)
}

fn backend(err: sqlx::Error) -> WorkflowError {
    WorkflowError::Storage(err.to_string())
}

fn to_i64(value: u64) -> WorkflowResult<i64> {
    i64::try_from(value).map_err(|_| WorkflowError::Storage("version value too large".to_string()))
}
