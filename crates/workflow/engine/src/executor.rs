//! Workflow executor: the state machine over stored instances
//!
//! Every mutation follows the same sequence:
//! 1. load the instance and check its status
//! 2. compute the new state against the instance's own definition
//! 3. compare-and-swap it into the store
//! 4. append the matching audit entry
//! 5. dispatch the step the instance is now waiting on
//!
//! A lost compare-and-swap returns `VersionConflict` to the caller unchanged.
//! The executor never retries a transition on its own, and holds no lock
//! across one.
//!
//! An audit append is retried a few times. If the ledger still refuses it,
//! the append is stored on the instance as `pending_audit`; the next
//! mutation of that instance, or [`WorkflowExecutor::recover_pending_audits`],
//! records it before anything else.

use crate::definition_registry::DefinitionRegistry;
use crate::dispatcher::{DispatchedTask, NoopDispatcher, TaskDispatcher};
use crate::retry::RetryPolicy;
use audit_ledger::{
    ActionType, AuditAppend, AuditEntry, AuditLedger, ChainVerification, EntityKey,
    InMemoryAuditLedger, LedgerError,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use workflow_storage::{ActiveKey, DefinitionStore, InMemoryInstanceStore, InstanceStore};
use workflow_types::{
    InstanceStatus, Step, StepId, WorkflowDefinition, WorkflowError, WorkflowInstance,
    WorkflowInstanceId, WorkflowResult,
};

const AUDIT_APPEND_ATTEMPTS: u32 = 3;
const AUDIT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Outcome of a recorded service failure that still has retries left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryScheduled {
    /// Consecutive failures on the current step, including this one
    pub attempt: u32,
    /// Backoff before the next attempt
    pub delay: Duration,
    /// Wall-clock time of the next attempt
    pub retry_at: DateTime<Utc>,
    /// Instance version after recording the failure
    pub version: u64,
}

/// Advances workflow instances through their definitions.
pub struct WorkflowExecutor {
    definitions: RwLock<DefinitionRegistry>,
    definition_store: Option<Arc<dyn DefinitionStore>>,
    instances: Arc<dyn InstanceStore>,
    ledger: Arc<dyn AuditLedger>,
    dispatcher: Arc<dyn TaskDispatcher>,
    retry: RetryPolicy,
}

impl WorkflowExecutor {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        ledger: Arc<dyn AuditLedger>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            definitions: RwLock::new(DefinitionRegistry::new()),
            definition_store: None,
            instances,
            ledger,
            dispatcher,
            retry: RetryPolicy::default(),
        }
    }

    /// Executor over fresh in-memory stores.
    pub fn in_memory(dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        let store = Arc::new(InMemoryInstanceStore::new());
        Self::new(store.clone(), Arc::new(InMemoryAuditLedger::new()), dispatcher)
            .with_definition_store(store)
    }

    /// In-memory executor that dispatches nothing.
    pub fn detached() -> Self {
        Self::in_memory(Arc::new(NoopDispatcher))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist newly registered definitions to `store`.
    pub fn with_definition_store(mut self, store: Arc<dyn DefinitionStore>) -> Self {
        self.definition_store = Some(store);
        self
    }

    /// Start from an existing registry, e.g. one hydrated from storage.
    pub fn with_registry(mut self, registry: DefinitionRegistry) -> Self {
        self.definitions = RwLock::new(registry);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ── Definition Management ────────────────────────────────────────

    /// Validate, version and register a definition
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let mut registry = self.definitions.write().await;
        match &self.definition_store {
            Some(store) => registry.register_and_persist(definition, store.as_ref()).await,
            None => registry.register(definition),
        }
    }

    /// Load definitions persisted by earlier runs
    pub async fn hydrate_definitions(&self) -> WorkflowResult<usize> {
        let Some(store) = &self.definition_store else {
            return Ok(0);
        };
        self.definitions.write().await.hydrate(store.as_ref()).await
    }

    /// Latest version of a definition by name
    pub async fn definition(&self, name: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.definitions.read().await.get(name)
    }

    pub async fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.definitions.read().await.list()
    }

    async fn definition_of(
        &self,
        instance: &WorkflowInstance,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .await
            .get_by_id(&instance.definition_id)
    }

    // ── Instance Lifecycle ───────────────────────────────────────────

    /// Create an instance at the definition's start step for a business entity.
    ///
    /// Fails with `DefinitionNotFound`, or `DuplicateActiveInstance` when the
    /// entity already has an Active instance of this definition.
    pub async fn start_workflow(
        &self,
        definition_name: &str,
        entity_type: &str,
        entity_id: &str,
        initiator: &str,
    ) -> WorkflowResult<WorkflowInstance> {
        let definition = self.definition(definition_name).await?;
        let instance = WorkflowInstance::start(&definition, entity_type, entity_id, initiator);
        let instance = self.instances.create(instance).await?;

        let append = AuditAppend::new(entity_key(&instance), ActionType::Create, initiator)
            .steps(None, step_str(&instance.current_step))
            .with_values(serde_json::Value::Null, snapshot(&instance));
        self.record(&instance, append).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition = %definition.name,
            version = definition.version,
            entity_type,
            entity_id,
            "Workflow started"
        );

        self.dispatch_current(&instance, &definition).await;
        Ok(instance)
    }

    /// Complete the current step with `outcome` and move to the step it routes to.
    ///
    /// Reaching a `null` transition, or entering a user task whose every
    /// outcome is `null`, completes the instance. Such a final user task is
    /// still dispatched so its assignee is notified.
    pub async fn complete_task(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        outcome: &str,
        actor: &str,
        note: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_active(id, expected_version).await?;
        let definition = self.definition_of(&instance).await?;
        let step = current_step(&instance, &definition)?;

        let target = step
            .resolve(outcome)
            .ok_or_else(|| WorkflowError::InvalidOutcome {
                step: step.id.clone(),
                outcome: outcome.to_string(),
            })?
            .cloned();

        let mut next = instance.clone();
        match &target {
            None => next.finish(),
            Some(target) => {
                next.enter(target.clone());
                if definition.get_step(target).is_some_and(Step::completes_on_entry) {
                    next.status = InstanceStatus::Completed;
                }
            }
        }

        let stored = self.commit(&instance, next).await?;

        let append = AuditAppend::new(entity_key(&stored), ActionType::Transition, actor)
            .steps(Some(step.id.as_str()), step_str(&target))
            .with_outcome(outcome)
            .with_note(note)
            .with_values(snapshot(&instance), snapshot(&stored));
        self.record(&stored, append).await?;

        if let Some(target) = &target {
            if stored.exceeds_max_visits(&definition, target) {
                tracing::warn!(
                    instance_id = %id,
                    step = %target,
                    visits = stored.visit_count(target),
                    "Step visited more often than its declared max_visits"
                );
            }
        }

        if stored.is_active() {
            tracing::info!(
                instance_id = %id,
                from = %step.id,
                to = ?target.as_ref().map(StepId::as_str),
                outcome,
                "Workflow transitioned"
            );
        } else {
            tracing::info!(
                instance_id = %id,
                from = %step.id,
                outcome,
                final_step = ?stored.current_step.as_ref().map(StepId::as_str),
                "Workflow completed"
            );
        }

        self.dispatch_current(&stored, &definition).await;
        Ok(stored)
    }

    /// Record a terminal failure of the current service task.
    ///
    /// While retries remain, schedules the next attempt and returns when it
    /// is due. The failure that reaches the policy's `max_failures` stalls the
    /// instance and returns `ServiceTaskExhausted`.
    pub async fn report_service_failure(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        detail: &str,
    ) -> WorkflowResult<RetryScheduled> {
        let instance = self.load_active(id, expected_version).await?;
        let definition = self.definition_of(&instance).await?;
        let step = current_step(&instance, &definition)?;
        if !step.is_service_task() {
            return Err(WorkflowError::NotServiceTask(step.id.clone()));
        }

        let failures = instance.service_failures + 1;
        let exhausted = self.retry.is_exhausted(failures);
        let delay = self.retry.delay_for(failures);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| WorkflowError::Config(format!("retry delay out of range: {e}")))?;

        let mut next = instance.clone();
        next.service_failures = failures;
        next.updated_at = Utc::now();
        if exhausted {
            next.status = InstanceStatus::Stalled;
            next.next_retry_at = None;
        } else {
            next.next_retry_at = Some(retry_at);
        }

        let stored = self.commit(&instance, next).await?;

        let append = AuditAppend::new(entity_key(&stored), ActionType::ServiceFailure, "system:service")
            .steps(Some(step.id.as_str()), Some(step.id.as_str()))
            .with_note(Some(detail.to_string()))
            .with_values(snapshot(&instance), snapshot(&stored));
        self.record(&stored, append).await?;

        if exhausted {
            tracing::warn!(
                instance_id = %id,
                step = %step.id,
                failures,
                "Service task retries exhausted; instance stalled"
            );
            return Err(WorkflowError::ServiceTaskExhausted {
                id: id.clone(),
                failures,
            });
        }

        tracing::info!(
            instance_id = %id,
            step = %step.id,
            attempt = failures,
            delay_secs = delay.as_secs(),
            "Service task retry scheduled"
        );
        Ok(RetryScheduled {
            attempt: failures,
            delay,
            retry_at,
            version: stored.version,
        })
    }

    /// Cancel an Active or Stalled instance. The audit trail is kept.
    pub async fn cancel(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        actor: &str,
        reason: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_at(id, expected_version).await?;
        if instance.is_terminal() {
            return Err(WorkflowError::InstanceNotActive {
                id: id.clone(),
                status: instance.status,
            });
        }

        let mut next = instance.clone();
        next.status = InstanceStatus::Cancelled;
        next.next_retry_at = None;
        next.updated_at = Utc::now();
        let stored = self.commit(&instance, next).await?;

        let step = step_str(&stored.current_step);
        let append = AuditAppend::new(entity_key(&stored), ActionType::Cancel, actor)
            .steps(step, step)
            .with_note(reason)
            .with_values(snapshot(&instance), snapshot(&stored));
        self.record(&stored, append).await?;

        tracing::info!(instance_id = %id, actor, "Workflow cancelled");
        Ok(stored)
    }

    /// Return a Stalled instance to Active on the same step and dispatch it again.
    ///
    /// Fails with `DuplicateActiveInstance` if another instance became Active
    /// for the same entity in the meantime.
    pub async fn resume(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        actor: &str,
        note: Option<String>,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_at(id, expected_version).await?;
        if instance.status != InstanceStatus::Stalled {
            return Err(WorkflowError::InstanceNotActive {
                id: id.clone(),
                status: instance.status,
            });
        }
        let definition = self.definition_of(&instance).await?;

        let mut next = instance.clone();
        next.status = InstanceStatus::Active;
        next.service_failures = 0;
        next.next_retry_at = None;
        next.updated_at = Utc::now();
        let stored = self.commit(&instance, next).await?;

        let step = step_str(&stored.current_step);
        let append = AuditAppend::new(entity_key(&stored), ActionType::Resume, actor)
            .steps(step, step)
            .with_note(note)
            .with_values(snapshot(&instance), snapshot(&stored));
        self.record(&stored, append).await?;

        tracing::info!(instance_id = %id, actor, "Workflow resumed");
        self.dispatch_current(&stored, &definition).await;
        Ok(stored)
    }

    /// Hand the current step of an Active instance to the dispatcher again.
    ///
    /// Returns `false` without dispatching when the instance is no longer at
    /// `expected_version`, i.e. the step has been completed, failed again or
    /// otherwise moved on since the caller looked at it.
    pub async fn redispatch(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
    ) -> WorkflowResult<bool> {
        let instance = self.instances.load(id).await?;
        if instance.version != expected_version {
            tracing::debug!(
                instance_id = %id,
                expected_version,
                actual_version = instance.version,
                "Redispatch skipped; instance has moved on"
            );
            return Ok(false);
        }
        if !instance.is_active() {
            return Err(WorkflowError::InstanceNotActive {
                id: id.clone(),
                status: instance.status,
            });
        }
        let definition = self.definition_of(&instance).await?;
        self.dispatch_current(&instance, &definition).await;
        Ok(true)
    }

    /// Record every audit append left pending by a failed ledger write.
    ///
    /// Run at startup and whenever the ledger is back after an outage.
    /// Instances that were waiting on a step are dispatched, since the
    /// failed operation returned before dispatching. Returns how many
    /// instances were repaired.
    pub async fn recover_pending_audits(&self) -> WorkflowResult<usize> {
        let pending = self.instances.list_audit_pending().await?;
        let mut recovered = 0;

        for instance in pending {
            let mut cleared = instance.clone();
            cleared.pending_audit = None;
            match self.commit(&instance, cleared).await {
                Ok(stored) => {
                    recovered += 1;
                    match self.definition_of(&stored).await {
                        Ok(definition) => self.dispatch_current(&stored, &definition).await,
                        Err(e) => tracing::warn!(
                            instance_id = %stored.id,
                            error = %e,
                            "Recovered instance has no registered definition"
                        ),
                    }
                }
                Err(e) => tracing::warn!(
                    instance_id = %instance.id,
                    error = %e,
                    "Pending audit entry not recovered"
                ),
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "Pending audit entries recorded");
        }
        Ok(recovered)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_instance(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance> {
        self.instances.load(id).await
    }

    /// The Active instance of the latest `definition_name` for an entity
    pub async fn active_instance(
        &self,
        definition_name: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> WorkflowResult<Option<WorkflowInstance>> {
        let definition = self.definition(definition_name).await?;
        let key = ActiveKey::new(definition.id.clone(), entity_type, entity_id);
        self.instances.find_active(&key).await
    }

    /// Instances waiting for an operator to resume or cancel them
    pub async fn stalled_instances(&self) -> WorkflowResult<Vec<WorkflowInstance>> {
        self.instances.list_by_status(InstanceStatus::Stalled).await
    }

    /// Audit entries of one entity in sequence order
    pub async fn history(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<Vec<AuditEntry>> {
        self.ledger
            .history(&EntityKey::new(entity_type, entity_id))
            .await
            .map_err(audit_error)
    }

    pub async fn verify_chain(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> WorkflowResult<ChainVerification> {
        self.ledger
            .verify_chain(&EntityKey::new(entity_type, entity_id))
            .await
            .map_err(audit_error)
    }

    /// Verify a chain and fail with `ChainBroken` unless it is intact.
    ///
    /// Gate for any decision that relies on the entity's audit trail.
    pub async fn require_intact_chain(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> WorkflowResult<ChainVerification> {
        let verification = self.verify_chain(entity_type, entity_id).await?;
        match verification.first_bad_seq {
            None => Ok(verification),
            Some(first_bad_seq) => {
                tracing::error!(entity_type, entity_id, first_bad_seq, "Audit chain broken");
                Err(WorkflowError::ChainBroken {
                    entity_type: entity_type.to_string(),
                    entity_id: entity_id.to_string(),
                    first_bad_seq,
                })
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Load an instance the caller last saw at `expected_version`.
    ///
    /// A stale version is reported before anything else, so a caller that
    /// lost a race always learns that it lost, whatever the winner did.
    async fn load_at(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.instances.load(id).await?;
        if instance.version != expected_version {
            return Err(WorkflowError::VersionConflict {
                id: id.clone(),
                expected: expected_version,
                actual: instance.version,
            });
        }
        Ok(instance)
    }

    async fn load_active(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
    ) -> WorkflowResult<WorkflowInstance> {
        let instance = self.load_at(id, expected_version).await?;
        if !instance.is_active() {
            return Err(WorkflowError::InstanceNotActive {
                id: id.clone(),
                status: instance.status,
            });
        }
        Ok(instance)
    }

    /// Swap `next` in for `current`, first recording any audit append an
    /// earlier change of `current` left pending.
    ///
    /// If that append still fails nothing is written, so the change and its
    /// predecessor's entry stay in order.
    async fn commit(
        &self,
        current: &WorkflowInstance,
        mut next: WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        if let Some(pending) = &current.pending_audit {
            let append: AuditAppend = serde_json::from_value(pending.clone())
                .map_err(|e| WorkflowError::Serialization(e.to_string()))?;
            self.ledger.append(append).await.map_err(audit_error)?;
            tracing::info!(instance_id = %current.id, "Pending audit entry recorded");
            next.pending_audit = None;
        }
        self.instances
            .compare_and_swap(&current.id, current.version, next)
            .await
    }

    /// Append the entry for a committed change, retrying a bounded number of
    /// times before leaving it pending on the instance.
    async fn record(&self, instance: &WorkflowInstance, append: AuditAppend) -> WorkflowResult<AuditEntry> {
        let mut attempt = 1;
        loop {
            match self.ledger.append(append.clone()).await {
                Ok(entry) => return Ok(entry),
                Err(e) if attempt < AUDIT_APPEND_ATTEMPTS => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        attempt,
                        error = %e,
                        "Audit append failed; retrying"
                    );
                    tokio::time::sleep(AUDIT_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        instance_id = %instance.id,
                        version = instance.version,
                        error = %e,
                        "State committed but audit append failed; leaving it pending"
                    );
                    self.mark_audit_pending(instance, &append).await;
                    return Err(audit_error(e));
                }
            }
        }
    }

    async fn mark_audit_pending(&self, instance: &WorkflowInstance, append: &AuditAppend) {
        let pending = match serde_json::to_value(append) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(instance_id = %instance.id, error = %e, "Cannot serialize pending audit entry");
                return;
            }
        };

        let mut marked = instance.clone();
        marked.pending_audit = Some(pending);
        if let Err(e) = self
            .instances
            .compare_and_swap(&instance.id, instance.version, marked)
            .await
        {
            tracing::error!(
                instance_id = %instance.id,
                error = %e,
                "Pending audit marker not stored; audit entry lost"
            );
        }
    }

    async fn dispatch_current(&self, instance: &WorkflowInstance, definition: &WorkflowDefinition) {
        let Some(step) = instance
            .current_step
            .as_ref()
            .and_then(|id| definition.get_step(id))
        else {
            return;
        };
        let notify_only = match instance.status {
            InstanceStatus::Active => false,
            InstanceStatus::Completed if step.completes_on_entry() => true,
            _ => return,
        };

        let task = DispatchedTask {
            instance_id: instance.id.clone(),
            version: instance.version,
            notify_only,
            step: step.clone(),
            entity_type: instance.entity_type.clone(),
            entity_id: instance.entity_id.clone(),
        };
        if let Err(e) = self.dispatcher.dispatch(task).await {
            tracing::warn!(
                instance_id = %instance.id,
                step = %step.id,
                error = %e,
                "Task dispatch failed"
            );
        }
    }
}

fn current_step<'a>(
    instance: &WorkflowInstance,
    definition: &'a WorkflowDefinition,
) -> WorkflowResult<&'a Step> {
    let step_id = instance.current_step.as_ref().ok_or_else(|| {
        WorkflowError::Storage(format!("active instance {} has no current step", instance.id))
    })?;
    definition.get_step(step_id).ok_or_else(|| {
        WorkflowError::Storage(format!(
            "instance {} is on step '{}', which definition {} does not declare",
            instance.id, step_id, definition.id
        ))
    })
}

fn entity_key(instance: &WorkflowInstance) -> EntityKey {
    EntityKey::new(instance.entity_type.clone(), instance.entity_id.clone())
}

fn step_str(step: &Option<StepId>) -> Option<&str> {
    step.as_ref().map(StepId::as_str)
}

/// The instance fields an audit digest commits to
fn snapshot(instance: &WorkflowInstance) -> serde_json::Value {
    serde_json::json!({
        "status": instance.status.as_str(),
        "current_step": instance.current_step,
        "version": instance.version,
        "service_failures": instance.service_failures,
    })
}

fn audit_error(err: LedgerError) -> WorkflowError {
    WorkflowError::Audit(err.to_string())
}
