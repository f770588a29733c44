use async_trait::async_trait;
use workflow_types::{
    InstanceStatus, WorkflowDefinition, WorkflowDefinitionId, WorkflowInstance,
    WorkflowError, WorkflowInstanceId, WorkflowResult,
};

/// Key under which at most one instance may be Active.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActiveKey {
    pub definition_id: WorkflowDefinitionId,
    pub entity_type: String,
    pub entity_id: String,
}

impl ActiveKey {
    pub fn new(
        definition_id: WorkflowDefinitionId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            definition_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn of(instance: &WorkflowInstance) -> Self {
        Self::new(
            instance.definition_id.clone(),
            instance.entity_type.clone(),
            instance.entity_id.clone(),
        )
    }

    /// The error reported when this key is already held by an Active instance
    pub fn duplicate(&self) -> WorkflowError {
        WorkflowError::DuplicateActiveInstance {
            definition_id: self.definition_id.to_string(),
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Durable state of workflow instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance.
    ///
    /// Fails with `DuplicateActiveInstance` when the instance is Active and
    /// another Active instance exists for the same key.
    async fn create(&self, instance: WorkflowInstance) -> WorkflowResult<WorkflowInstance>;

    /// Load one instance; `InstanceNotFound` if absent.
    async fn load(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance>;

    /// Replace the stored state if its version still equals `expected_version`.
    ///
    /// The stored row gets `version = expected_version + 1` and is returned.
    /// Fails with `VersionConflict` on a stale version, and with
    /// `DuplicateActiveInstance` if the new state is Active while another
    /// instance holds the key.
    async fn compare_and_swap(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        new_state: WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance>;

    /// The Active instance for a key, if any.
    async fn find_active(&self, key: &ActiveKey) -> WorkflowResult<Option<WorkflowInstance>>;

    /// All instances in one status, oldest first.
    async fn list_by_status(&self, status: InstanceStatus) -> WorkflowResult<Vec<WorkflowInstance>>;

    /// Instances carrying an audit append that was never recorded.
    async fn list_audit_pending(&self) -> WorkflowResult<Vec<WorkflowInstance>>;
}

/// Persistence for registered definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Store a validated definition. Saving the same id twice is a no-op.
    async fn save_definition(&self, definition: &WorkflowDefinition) -> WorkflowResult<()>;

    /// Every stored definition, ordered by name then version.
    async fn load_definitions(&self) -> WorkflowResult<Vec<WorkflowDefinition>>;
}
