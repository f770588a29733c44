use crate::{InstanceStatus, StepId, WorkflowInstanceId};
use thiserror::Error;

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors surfaced by the workflow core.
///
/// Every mutating operation returns these synchronously to its caller. Only
/// [`WorkflowError::VersionConflict`] is recoverable by re-reading and
/// resubmitting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid workflow definition{}: {reason}", step.as_ref().map(|s| format!(" at step '{}'", s)).unwrap_or_default())]
    InvalidDefinition {
        step: Option<StepId>,
        reason: String,
    },

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("an active '{definition_id}' instance already exists for {entity_type}/{entity_id}")]
    DuplicateActiveInstance {
        definition_id: String,
        entity_type: String,
        entity_id: String,
    },

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(WorkflowInstanceId),

    #[error("workflow instance {id} is not active (status: {status})")]
    InstanceNotActive {
        id: WorkflowInstanceId,
        status: InstanceStatus,
    },

    #[error("outcome '{outcome}' is not declared by step '{step}'")]
    InvalidOutcome { step: StepId, outcome: String },

    #[error("version conflict on instance {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: WorkflowInstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("service task on instance {id} exhausted after {failures} failures; instance stalled")]
    ServiceTaskExhausted {
        id: WorkflowInstanceId,
        failures: u32,
    },

    #[error("step '{0}' is not a service task")]
    NotServiceTask(StepId),

    #[error("audit chain for {entity_type}/{entity_id} is broken at seq {first_bad_seq}")]
    ChainBroken {
        entity_type: String,
        entity_id: String,
        first_bad_seq: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("audit ledger error: {0}")]
    Audit(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    pub fn invalid_definition(step: Option<StepId>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            step,
            reason: reason.into(),
        }
    }

    /// Whether the caller may re-read the instance and resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
