//! Workflow instances: one execution of a definition bound to a business entity
//!
//! An instance is a versioned row. Every mutation goes through the store's
//! compare-and-swap, so `version` doubles as the optimistic-concurrency token
//! callers pass back as `expected_version`.

use crate::{StepId, WorkflowDefinition, WorkflowDefinitionId, WorkflowError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// ── Instance Identifier ──────────────────────────────────────────────

/// Unique identifier for a workflow instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub String);

impl WorkflowInstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A running (or finished) instance of a workflow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique instance identifier
    pub id: WorkflowInstanceId,
    /// The definition this instance runs against, by id
    pub definition_id: WorkflowDefinitionId,
    /// Opaque business entity type (e.g. `"budget"`)
    pub entity_type: String,
    /// Opaque business key (e.g. `"BUD2024000123"`)
    pub entity_id: String,
    /// The step awaiting completion; `None` once a `null` transition ended the run
    pub current_step: Option<StepId>,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Monotonic version, bumped by every successful compare-and-swap
    pub version: u64,
    /// How many times each step has been entered
    #[serde(default)]
    pub visits: BTreeMap<StepId, u32>,
    /// Consecutive service-task failures on the current step
    #[serde(default)]
    pub service_failures: u32,
    /// When the dispatcher should retry the current service task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Audit append for a committed change that the ledger did not accept.
    /// The next mutation, or a recovery pass, records it and clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_audit: Option<serde_json::Value>,
    /// Who started the workflow
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create an instance positioned on the definition's start step
    pub fn start(
        definition: &WorkflowDefinition,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut instance = Self {
            id: WorkflowInstanceId::generate(),
            definition_id: definition.id.clone(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            current_step: None,
            status: InstanceStatus::Active,
            version: 1,
            visits: BTreeMap::new(),
            service_failures: 0,
            next_retry_at: None,
            pending_audit: None,
            initiator: initiator.into(),
            created_at: now,
            updated_at: now,
        };
        instance.enter(definition.start_step.clone());
        instance
    }

    /// Move onto `step`, counting the visit and clearing retry state
    pub fn enter(&mut self, step: StepId) {
        *self.visits.entry(step.clone()).or_insert(0) += 1;
        self.current_step = Some(step);
        self.service_failures = 0;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    /// Finish the run by resolving a terminal (`null`) transition
    pub fn finish(&mut self) {
        self.current_step = None;
        self.status = InstanceStatus::Completed;
        self.service_failures = 0;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of times `step` has been entered
    pub fn visit_count(&self, step: &StepId) -> u32 {
        self.visits.get(step).copied().unwrap_or(0)
    }

    /// Whether `step` has been entered more often than its declared `max_visits`
    pub fn exceeds_max_visits(&self, definition: &WorkflowDefinition, step: &StepId) -> bool {
        definition
            .get_step(step)
            .and_then(|s| s.max_visits)
            .is_some_and(|max| self.visit_count(step) > max)
    }

    /// Duration since creation
    pub fn elapsed_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds()
    }

    /// Duration since the last state change
    pub fn idle_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.updated_at)
            .num_seconds()
    }
}

// ── Instance Status ──────────────────────────────────────────────────

/// The lifecycle status of a workflow instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InstanceStatus {
    /// Waiting on the current step
    #[default]
    Active,
    /// Reached a terminal transition
    Completed,
    /// Cancelled by an administrative action
    Cancelled,
    /// Service task retries exhausted; needs an operator to resume or cancel
    Stalled,
}

impl InstanceStatus {
    /// Completed and Cancelled never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Stalled => "Stalled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Completed" => Ok(Self::Completed),
            "Cancelled" => Ok(Self::Cancelled),
            "Stalled" => Ok(Self::Stalled),
            other => Err(WorkflowError::Serialization(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Step;

    fn make_loop_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("tender", "open")
            .with_step(Step::user_task("open", "procurement").then("closed"))
            .with_step(
                Step::user_task("closed", "procurement")
                    .on("re_tender", "open")
                    .on_finish("awarded")
                    .with_max_visits(2),
            )
    }

    #[test]
    fn test_start_positions_on_start_step() {
        let def = make_loop_definition();
        let inst = WorkflowInstance::start(&def, "tender", "TND-1", "clerk-7");

        assert!(inst.is_active());
        assert_eq!(inst.version, 1);
        assert_eq!(inst.current_step, Some(StepId::new("open")));
        assert_eq!(inst.visit_count(&StepId::new("open")), 1);
        assert_eq!(inst.definition_id, def.id);
    }

    #[test]
    fn test_enter_counts_visits_and_resets_failures() {
        let def = make_loop_definition();
        let mut inst = WorkflowInstance::start(&def, "tender", "TND-1", "clerk-7");
        inst.service_failures = 3;
        inst.next_retry_at = Some(Utc::now());

        inst.enter(StepId::new("closed"));
        inst.enter(StepId::new("open"));
        inst.enter(StepId::new("closed"));
        inst.enter(StepId::new("open"));
        inst.enter(StepId::new("closed"));

        assert_eq!(inst.visit_count(&StepId::new("open")), 3);
        assert_eq!(inst.visit_count(&StepId::new("closed")), 3);
        assert_eq!(inst.service_failures, 0);
        assert!(inst.next_retry_at.is_none());
        assert!(inst.exceeds_max_visits(&def, &StepId::new("closed")));
        assert!(!inst.exceeds_max_visits(&def, &StepId::new("open")));
    }

    #[test]
    fn test_finish() {
        let def = make_loop_definition();
        let mut inst = WorkflowInstance::start(&def, "tender", "TND-1", "clerk-7");
        inst.finish();

        assert!(inst.is_terminal());
        assert_eq!(inst.current_step, None);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            InstanceStatus::Active,
            InstanceStatus::Completed,
            InstanceStatus::Cancelled,
            InstanceStatus::Stalled,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_stalled_is_not_terminal() {
        assert!(!InstanceStatus::Stalled.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }
}
