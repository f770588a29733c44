//! Workflow definitions: the immutable step graph a business process runs on
//!
//! A WorkflowDefinition is a directed graph where:
//! - Steps are user tasks (a role must act) or service tasks (a callback runs)
//! - Each step maps outcome labels to the next step, or to `null` (terminal)
//!
//! Definitions are immutable once registered. To change a process, register
//! a new definition; running instances keep the graph they started on.

use crate::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Outcome assumed for steps that declare no explicit outcomes.
pub const DEFAULT_OUTCOME: &str = "done";

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a workflow definition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowDefinitionId(pub String);

impl WorkflowDefinitionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within its definition
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow Definition ──────────────────────────────────────────────

/// A workflow definition: the graph of steps and their legal outcomes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier
    #[serde(default = "WorkflowDefinitionId::generate")]
    pub id: WorkflowDefinitionId,
    /// Lookup name, shared by every version of the same process
    pub name: String,
    /// Description of what this workflow accomplishes
    #[serde(default)]
    pub description: String,
    /// Version within `name`; assigned by the registry
    #[serde(default = "default_version")]
    pub version: u32,
    /// The steps of the graph, keyed by id
    pub steps: BTreeMap<StepId, Step>,
    /// Where every instance begins
    pub start_step: StepId,
    /// When this definition was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Create a new, empty workflow definition
    pub fn new(name: impl Into<String>, start_step: impl Into<String>) -> Self {
        Self {
            id: WorkflowDefinitionId::generate(),
            name: name.into(),
            description: String::new(),
            version: 1,
            steps: BTreeMap::new(),
            start_step: StepId::new(start_step),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = WorkflowDefinitionId::new(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a step, builder style. Duplicates are caught by [`validate`](Self::validate).
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.insert(step.id.clone(), step);
        self
    }

    /// Add a step to the graph
    pub fn add_step(&mut self, step: Step) -> WorkflowResult<()> {
        if self.steps.contains_key(&step.id) {
            return Err(WorkflowError::invalid_definition(
                Some(step.id.clone()),
                "duplicate step id",
            ));
        }
        self.steps.insert(step.id.clone(), step);
        Ok(())
    }

    /// Parse a definition from its JSON graph form
    pub fn from_json(json: &str) -> WorkflowResult<Self> {
        serde_json::from_str(json).map_err(|e| WorkflowError::Serialization(e.to_string()))
    }

    /// Parse either a single definition object or an array of definitions
    pub fn from_json_many(json: &str) -> WorkflowResult<Vec<Self>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<WorkflowDefinition>),
            One(Box<WorkflowDefinition>),
        }

        match serde_json::from_str::<OneOrMany>(json)
            .map_err(|e| WorkflowError::Serialization(e.to_string()))?
        {
            OneOrMany::Many(defs) => Ok(defs),
            OneOrMany::One(def) => Ok(vec![*def]),
        }
    }

    /// Serialize the graph to JSON (the persisted `graph_json` form)
    pub fn to_json(&self) -> WorkflowResult<String> {
        serde_json::to_string(self).map_err(|e| WorkflowError::Serialization(e.to_string()))
    }

    /// Get a step by ID
    pub fn get_step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    /// The step every instance starts on
    pub fn start(&self) -> Option<&Step> {
        self.steps.get(&self.start_step)
    }

    /// Total number of steps
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Validate the definition for structural correctness.
    ///
    /// Steps are checked in id order and the first violation is returned,
    /// naming the offending step where there is one.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::invalid_definition(
                None,
                "workflow must have at least one step",
            ));
        }

        let start = self.steps.get(&self.start_step).ok_or_else(|| {
            WorkflowError::invalid_definition(
                Some(self.start_step.clone()),
                "start step is not defined",
            )
        })?;

        for (key, step) in &self.steps {
            if key != &step.id {
                return Err(WorkflowError::invalid_definition(
                    Some(key.clone()),
                    format!("step is keyed as '{}' but declares id '{}'", key, step.id),
                ));
            }
            step.validate_against(self)?;
        }

        if start.is_terminal() {
            return Err(WorkflowError::invalid_definition(
                Some(start.id.clone()),
                "start step must not be terminal",
            ));
        }

        let reachable = self.reachable_steps();
        let can_finish = reachable
            .iter()
            .filter_map(|id| self.steps.get(*id))
            .any(|step| step.next.values().any(Option::is_none));
        if !can_finish {
            return Err(WorkflowError::invalid_definition(
                None,
                "no step reachable from the start step resolves to a terminal transition",
            ));
        }

        Ok(())
    }

    /// All step ids reachable from `start_step` (including it)
    pub fn reachable_steps(&self) -> HashSet<&StepId> {
        let mut visited = HashSet::new();
        let mut queue = vec![&self.start_step];

        while let Some(current) = queue.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(step) = self.steps.get(current) {
                for target in step.next.values().flatten() {
                    if !visited.contains(target) {
                        queue.push(target);
                    }
                }
            }
        }

        visited
    }
}

// ── Step ─────────────────────────────────────────────────────────────

/// What happens when an instance enters a step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A human holding `assignee_role` must complete the step
    UserTask { assignee_role: String },
    /// The service registered under `service_ref` completes the step
    ServiceTask { service_ref: String },
}

/// A step in the workflow graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    pub kind: StepKind,
    /// Legal outcome labels; empty means the single implicit outcome `"done"`
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub outcomes: BTreeSet<String>,
    /// Outcome label → next step, `None` (JSON `null`) when terminal
    pub next: BTreeMap<String, Option<StepId>>,
    /// Declared loop guard; tracked by the engine, enforced by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_visits: Option<u32>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId::new(id),
            kind,
            outcomes: BTreeSet::new(),
            next: BTreeMap::new(),
            max_visits: None,
        }
    }

    /// Create a user task assigned to `role`
    pub fn user_task(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::UserTask {
                assignee_role: role.into(),
            },
        )
    }

    /// Create a service task handled by `service_ref`
    pub fn service_task(id: impl Into<String>, service_ref: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::ServiceTask {
                service_ref: service_ref.into(),
            },
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Single implicit transition (`"done"`) to `target`
    pub fn then(self, target: impl Into<String>) -> Self {
        self.on(DEFAULT_OUTCOME, target)
    }

    /// Single implicit transition (`"done"`) ending the workflow
    pub fn then_finish(self) -> Self {
        self.on_finish(DEFAULT_OUTCOME)
    }

    /// Declare `outcome` and route it to `target`.
    ///
    /// The implicit `"done"` outcome is never added to the declared set, so a
    /// step built only with [`then`](Self::then) keeps an empty outcome set.
    pub fn on(mut self, outcome: impl Into<String>, target: impl Into<String>) -> Self {
        let outcome = outcome.into();
        if outcome != DEFAULT_OUTCOME || !self.outcomes.is_empty() {
            self.outcomes.insert(outcome.clone());
        }
        self.next.insert(outcome, Some(StepId::new(target)));
        self
    }

    /// Declare `outcome` as a terminal transition
    pub fn on_finish(mut self, outcome: impl Into<String>) -> Self {
        let outcome = outcome.into();
        if outcome != DEFAULT_OUTCOME || !self.outcomes.is_empty() {
            self.outcomes.insert(outcome.clone());
        }
        self.next.insert(outcome, None);
        self
    }

    pub fn with_max_visits(mut self, max: u32) -> Self {
        self.max_visits = Some(max);
        self
    }

    /// The outcomes a caller may complete this step with
    pub fn effective_outcomes(&self) -> BTreeSet<&str> {
        if self.outcomes.is_empty() {
            BTreeSet::from([DEFAULT_OUTCOME])
        } else {
            self.outcomes.iter().map(String::as_str).collect()
        }
    }

    /// Whether `outcome` is legal on this step
    pub fn accepts(&self, outcome: &str) -> bool {
        if self.outcomes.is_empty() {
            outcome == DEFAULT_OUTCOME
        } else {
            self.outcomes.contains(outcome)
        }
    }

    /// Resolve an outcome: `None` if illegal, `Some(None)` if terminal
    pub fn resolve(&self, outcome: &str) -> Option<Option<&StepId>> {
        if !self.accepts(outcome) {
            return None;
        }
        self.next.get(outcome).map(Option::as_ref)
    }

    /// A step whose every outcome ends the workflow
    pub fn is_terminal(&self) -> bool {
        self.effective_outcomes()
            .iter()
            .all(|outcome| matches!(self.next.get(*outcome), Some(None)))
    }

    /// Whether entering this step completes the instance at it.
    ///
    /// Only terminal user tasks do; their assignee is notified and nothing
    /// reports back. A terminal service task still has to run, so the
    /// instance stays Active until the task resolves its `null` transition.
    pub fn completes_on_entry(&self) -> bool {
        self.is_terminal() && self.is_user_task()
    }

    pub fn is_user_task(&self) -> bool {
        matches!(self.kind, StepKind::UserTask { .. })
    }

    pub fn is_service_task(&self) -> bool {
        matches!(self.kind, StepKind::ServiceTask { .. })
    }

    fn validate_against(&self, definition: &WorkflowDefinition) -> WorkflowResult<()> {
        let fail = |reason: String| -> WorkflowResult<()> {
            Err(WorkflowError::invalid_definition(
                Some(self.id.clone()),
                reason,
            ))
        };

        match &self.kind {
            StepKind::UserTask { assignee_role } if assignee_role.trim().is_empty() => {
                return fail("user task has no assignee role".into());
            }
            StepKind::ServiceTask { service_ref } if service_ref.trim().is_empty() => {
                return fail("service task has no service reference".into());
            }
            _ => {}
        }

        let outcomes = self.effective_outcomes();
        for outcome in &outcomes {
            if !self.next.contains_key(*outcome) {
                return fail(format!("outcome '{}' has no next transition", outcome));
            }
        }

        for (outcome, target) in &self.next {
            if !outcomes.contains(outcome.as_str()) {
                return fail(format!(
                    "transition for undeclared outcome '{}'",
                    outcome
                ));
            }
            if let Some(target) = target {
                if !definition.steps.contains_key(target) {
                    return fail(format!(
                        "outcome '{}' points to unknown step '{}'",
                        outcome, target
                    ));
                }
            }
        }

        if self.max_visits == Some(0) {
            return fail("max_visits must be at least 1".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_review_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("document_review", "draft")
            .with_description("Draft, review, publish")
            .with_step(Step::user_task("draft", "author").then("review"))
            .with_step(
                Step::user_task("review", "reviewer")
                    .on("approved", "publish")
                    .on("changes_requested", "draft")
                    .on_finish("rejected"),
            )
            .with_step(Step::service_task("publish", "cms.publish").then("published"))
            .with_step(Step::user_task("published", "author").then_finish())
    }

    fn violation_step(result: WorkflowResult<()>) -> Option<StepId> {
        match result {
            Err(WorkflowError::InvalidDefinition { step, .. }) => step,
            other => panic!("expected InvalidDefinition, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_valid_workflow() {
        let wf = make_review_workflow();
        assert!(wf.validate().is_ok());
        assert_eq!(wf.step_count(), 4);
    }

    #[test]
    fn test_implicit_done_outcome() {
        let step = Step::user_task("draft", "author").then("review");
        assert!(step.outcomes.is_empty());
        assert!(step.accepts("done"));
        assert!(!step.accepts("approved"));
        assert_eq!(step.resolve("done"), Some(Some(&StepId::new("review"))));
        assert_eq!(step.resolve("approved"), None);
    }

    #[test]
    fn test_explicit_outcomes_reject_done() {
        let wf = make_review_workflow();
        let review = wf.get_step(&StepId::new("review")).unwrap();
        assert!(!review.accepts("done"));
        assert_eq!(review.resolve("rejected"), Some(None));
        assert!(!review.is_terminal());
    }

    #[test]
    fn test_terminal_step() {
        let step = Step::user_task("active", "finance").then_finish();
        assert!(step.is_terminal());
        assert!(step.completes_on_entry());

        let payout = Step::service_task("payout", "payments.release").then_finish();
        assert!(payout.is_terminal());
        assert!(!payout.completes_on_entry());
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let wf = WorkflowDefinition::new("bad", "a")
            .with_step(Step::user_task("a", "clerk").then("b"))
            .with_step(Step::user_task("b", "clerk").on("ok", "ghost").on_finish("stop"));
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("b")));
    }

    #[test]
    fn test_missing_start_step() {
        let wf = WorkflowDefinition::new("bad", "nowhere")
            .with_step(Step::user_task("a", "clerk").then_finish());
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("nowhere")));
    }

    #[test]
    fn test_orphaned_outcome_rejected() {
        let mut step = Step::user_task("a", "clerk").on_finish("approved");
        step.outcomes.insert("rejected".into());
        let wf = WorkflowDefinition::new("bad", "start")
            .with_step(Step::user_task("start", "clerk").then("a"))
            .with_step(step);
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_undeclared_transition_rejected() {
        let mut step = Step::user_task("a", "clerk").on_finish("approved");
        step.next.insert("escalate".into(), None);
        let wf = WorkflowDefinition::new("bad", "a").with_step(step);
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("a")));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let mut wf = WorkflowDefinition::new("bad", "a")
            .with_step(Step::user_task("a", "clerk").then_finish());
        let step = Step::user_task("b", "clerk").then_finish();
        wf.steps.insert(StepId::new("c"), step);
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("c")));
    }

    #[test]
    fn test_empty_role_rejected() {
        let wf = WorkflowDefinition::new("bad", "a")
            .with_step(Step::user_task("a", " ").on_finish("ok").on("retry", "a"));
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("a")));
    }

    #[test]
    fn test_terminal_start_rejected() {
        let wf = WorkflowDefinition::new("bad", "a")
            .with_step(Step::user_task("a", "clerk").then_finish());
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("start step must not be terminal"));
    }

    #[test]
    fn test_endless_loop_rejected() {
        let wf = WorkflowDefinition::new("loop", "a")
            .with_step(Step::user_task("a", "clerk").then("b"))
            .with_step(Step::user_task("b", "clerk").then("a"));
        assert_eq!(violation_step(wf.validate()), None);
    }

    #[test]
    fn test_zero_max_visits_rejected() {
        let wf = WorkflowDefinition::new("bad", "a")
            .with_step(Step::user_task("a", "clerk").on("again", "a").on_finish("stop"))
            .with_step(Step::user_task("z", "clerk").then_finish().with_max_visits(0));
        assert_eq!(violation_step(wf.validate()), Some(StepId::new("z")));
    }

    #[test]
    fn test_add_step_duplicate() {
        let mut wf = WorkflowDefinition::new("dup", "a");
        wf.add_step(Step::user_task("a", "clerk").then_finish()).unwrap();
        let result = wf.add_step(Step::user_task("a", "other").then_finish());
        assert!(matches!(result, Err(WorkflowError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_reachable_steps() {
        let wf = make_review_workflow();
        let reachable = wf.reachable_steps();
        assert_eq!(reachable.len(), 4);
        assert!(reachable.contains(&StepId::new("published")));
    }

    #[test]
    fn test_json_round_trip() {
        let wf = make_review_workflow();
        let json = wf.to_json().unwrap();
        let parsed = WorkflowDefinition::from_json(&json).unwrap();

        assert_eq!(parsed.id, wf.id);
        assert_eq!(parsed.start_step, wf.start_step);
        assert_eq!(parsed.step_count(), 4);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_json_graph_form() {
        let json = r#"{
            "name": "leave_request",
            "start_step": "request",
            "steps": {
                "request": {
                    "id": "request",
                    "kind": { "type": "user_task", "assignee_role": "employee" },
                    "next": { "done": "manager" }
                },
                "manager": {
                    "id": "manager",
                    "kind": { "type": "user_task", "assignee_role": "manager" },
                    "outcomes": ["granted", "denied"],
                    "next": { "granted": "payroll", "denied": null }
                },
                "payroll": {
                    "id": "payroll",
                    "kind": { "type": "service_task", "service_ref": "payroll.sync" },
                    "next": { "done": null }
                }
            }
        }"#;

        let defs = WorkflowDefinition::from_json_many(json).unwrap();
        assert_eq!(defs.len(), 1);
        let def = &defs[0];
        assert!(def.validate().is_ok());
        assert_eq!(def.version, 1);
        assert!(def.get_step(&StepId::new("payroll")).unwrap().is_service_task());
        let payroll = def.get_step(&StepId::new("payroll")).unwrap();
        assert!(payroll.is_terminal());
        assert!(!payroll.completes_on_entry());
    }

    #[test]
    fn test_malformed_json() {
        let result = WorkflowDefinition::from_json("{ \"name\": 1 }");
        assert!(matches!(result, Err(WorkflowError::Serialization(_))));
    }

    #[test]
    fn test_definition_id() {
        let id = WorkflowDefinitionId::generate();
        assert!(!id.0.is_empty());
        assert_ne!(id, WorkflowDefinitionId::generate());

        let named = WorkflowDefinitionId::new("budget-v1");
        assert_eq!(format!("{}", named), "budget-v1");
    }
}
