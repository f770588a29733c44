//! Engine configuration and wiring
//!
//! Sources are layered: built-in defaults, then an optional file (TOML,
//! JSON or YAML), then `WORKFLOW_*` environment variables with `__`
//! between nesting levels (`WORKFLOW_RETRY__MAX_FAILURES=3`,
//! `WORKFLOW_STORAGE__TYPE=postgres`).

use crate::definition_registry::DefinitionRegistry;
use crate::dispatcher::TaskDispatcher;
use crate::executor::WorkflowExecutor;
use crate::retry::RetryPolicy;
use audit_ledger::{AuditLedger, InMemoryAuditLedger};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use workflow_storage::{DefinitionStore, InMemoryInstanceStore, InstanceStore};
use workflow_types::{WorkflowDefinition, WorkflowError, WorkflowResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service-task retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Instance store and audit ledger backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Definition files registered at startup
    #[serde(default)]
    pub definitions: DefinitionsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Definition files to load at startup.
///
/// Each file holds one definition object or an array of them. Definitions
/// whose `id` is already registered are skipped, so files should carry
/// explicit ids to make restarts idempotent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl DefinitionsConfig {
    /// Parse every configured file, in order
    pub fn load(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        let mut definitions = Vec::new();
        for path in &self.files {
            definitions.extend(load_definition_file(path)?);
        }
        Ok(definitions)
    }
}

/// Parse one definition file (a single object or an array).
pub fn load_definition_file(path: &std::path::Path) -> WorkflowResult<Vec<WorkflowDefinition>> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        WorkflowError::Config(format!("cannot read definition file {}: {e}", path.display()))
    })?;
    WorkflowDefinition::from_json_many(&json)
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> WorkflowResult<Self> {
        let config_err = |e: config::ConfigError| WorkflowError::Config(e.to_string());

        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Config::try_from(&EngineConfig::default()).map_err(config_err)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_err)
    }
}

/// Build an executor over the configured backend.
///
/// Persisted definitions are loaded first, then any configured definition
/// files whose ids are not yet known are registered and persisted. Audit
/// entries left pending by an earlier run are recorded before returning.
pub async fn build_executor(
    config: &EngineConfig,
    dispatcher: Arc<dyn TaskDispatcher>,
) -> WorkflowResult<WorkflowExecutor> {
    let (instances, definitions, ledger) = open_storage(&config.storage).await?;

    let mut registry = DefinitionRegistry::new();
    registry.hydrate(definitions.as_ref()).await?;
    for definition in config.definitions.load()? {
        if registry.contains(&definition.id) {
            continue;
        }
        registry
            .register_and_persist(definition, definitions.as_ref())
            .await?;
    }

    let executor = WorkflowExecutor::new(instances, ledger, dispatcher)
        .with_definition_store(definitions)
        .with_registry(registry)
        .with_retry_policy(config.retry.clone());
    executor.recover_pending_audits().await?;
    Ok(executor)
}

/// Instance store, definition store and audit ledger of one backend.
pub type Backends = (
    Arc<dyn InstanceStore>,
    Arc<dyn DefinitionStore>,
    Arc<dyn AuditLedger>,
);

/// Open the configured instance store, definition store and audit ledger.
pub async fn open_storage(storage: &StorageConfig) -> WorkflowResult<Backends> {
    match storage {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            let store = Arc::new(InMemoryInstanceStore::new());
            let instances: Arc<dyn InstanceStore> = store.clone();
            let definitions: Arc<dyn DefinitionStore> = store;
            let ledger: Arc<dyn AuditLedger> = Arc::new(InMemoryAuditLedger::new());
            Ok((instances, definitions, ledger))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            tracing::info!(max_connections, "Using PostgreSQL storage");
            let store = Arc::new(
                workflow_storage::PostgresWorkflowStore::connect_with_options(
                    url,
                    *max_connections,
                    *connect_timeout_secs,
                )
                .await?,
            );
            let ledger = audit_ledger::PostgresAuditLedger::from_pool(store.pool().clone())
                .await
                .map_err(|e| WorkflowError::Audit(e.to_string()))?;
            let instances: Arc<dyn InstanceStore> = store.clone();
            let definitions: Arc<dyn DefinitionStore> = store;
            let ledger: Arc<dyn AuditLedger> = Arc::new(ledger);
            Ok((instances, definitions, ledger))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(WorkflowError::Config(
            "postgres storage requires the `postgres` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::NoopDispatcher;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.retry.max_failures, 5);
        assert_eq!(config.logging.level, "info");
        assert!(config.definitions.files.is_empty());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = write_temp(
            "engine.toml",
            r#"
[retry]
max_failures = 3
max_delay_secs = 60

[storage]
type = "postgres"
url = "postgres://localhost/workflow"

[logging]
json = true
"#,
        );
        let config = EngineConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.retry.max_failures, 3);
        assert_eq!(config.retry.max_delay_secs, 60);
        assert_eq!(config.retry.initial_delay_secs, 1);
        assert!(config.logging.json);
        match config.storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                ..
            } => {
                assert_eq!(url, "postgres://localhost/workflow");
                assert_eq!(max_connections, 10);
            }
            other => panic!("expected postgres storage, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = EngineConfig::load(Some("/nonexistent/workflow-engine.toml")).unwrap_err();
        assert!(matches!(err, WorkflowError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_executor_registers_definition_files() {
        let path = write_temp(
            "defs.json",
            r#"{
                "id": "leave-request-v1",
                "name": "leave_request",
                "start_step": "manager",
                "steps": {
                    "manager": {
                        "id": "manager",
                        "name": "Manager review",
                        "kind": {"type": "user_task", "assignee_role": "manager"},
                        "next": {"done": "hr"}
                    },
                    "hr": {
                        "id": "hr",
                        "name": "HR sign-off",
                        "kind": {"type": "user_task", "assignee_role": "hr"},
                        "next": {"done": null}
                    }
                }
            }"#,
        );
        let config = EngineConfig {
            definitions: DefinitionsConfig {
                files: vec![path.clone()],
            },
            ..Default::default()
        };

        let executor = build_executor(&config, Arc::new(NoopDispatcher)).await.unwrap();
        std::fs::remove_file(&path).ok();

        let definition = executor.definition("leave_request").await.unwrap();
        assert_eq!(definition.id.0, "leave-request-v1");
        assert_eq!(definition.version, 1);
    }
}
