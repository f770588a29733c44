//! Ledger outages: retried appends, entries left pending on the instance,
//! and how they are recorded once the ledger is back.

use async_trait::async_trait;
use audit_ledger::{
    ActionType, AuditAppend, AuditEntry, AuditLedger, EntityKey, InMemoryAuditLedger,
    LedgerError, LedgerResult,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use workflow_engine::{NoopDispatcher, WorkflowExecutor};
use workflow_storage::InMemoryInstanceStore;
use workflow_types::{InstanceStatus, Step, StepId, WorkflowDefinition, WorkflowError};

/// In-memory ledger that refuses the next `n` appends.
#[derive(Default)]
struct UnreliableLedger {
    inner: InMemoryAuditLedger,
    refuse: AtomicU32,
}

impl UnreliableLedger {
    fn refuse_next(&self, appends: u32) {
        self.refuse.store(appends, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLedger for UnreliableLedger {
    async fn append(&self, append: AuditAppend) -> LedgerResult<AuditEntry> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(LedgerError::Backend("ledger unavailable".into()));
        }
        self.inner.append(append).await
    }

    async fn history(&self, entity: &EntityKey) -> LedgerResult<Vec<AuditEntry>> {
        self.inner.history(entity).await
    }

    async fn head(&self, entity: &EntityKey) -> LedgerResult<Option<AuditEntry>> {
        self.inner.head(entity).await
    }
}

async fn setup(definition: WorkflowDefinition) -> (WorkflowExecutor, Arc<UnreliableLedger>) {
    let store = Arc::new(InMemoryInstanceStore::new());
    let ledger = Arc::new(UnreliableLedger::default());
    let executor = WorkflowExecutor::new(store.clone(), ledger.clone(), Arc::new(NoopDispatcher))
        .with_definition_store(store);
    executor.register_definition(definition).await.unwrap();
    (executor, ledger)
}

fn two_step() -> WorkflowDefinition {
    WorkflowDefinition::new("permit", "intake")
        .with_step(Step::user_task("intake", "clerk").then("sign_off"))
        .with_step(Step::user_task("sign_off", "director").then_finish())
}

fn three_step() -> WorkflowDefinition {
    WorkflowDefinition::new("permit", "intake")
        .with_step(Step::user_task("intake", "clerk").then("inspection"))
        .with_step(Step::user_task("inspection", "inspector").then("sign_off"))
        .with_step(Step::user_task("sign_off", "director").then_finish())
}

#[tokio::test]
async fn transient_ledger_failures_are_retried() {
    let (executor, ledger) = setup(two_step()).await;
    let inst = executor
        .start_workflow("permit", "permit", "PRM-1", "clerk-1")
        .await
        .unwrap();

    ledger.refuse_next(2);
    let inst = executor
        .complete_task(&inst.id, inst.version, "done", "clerk-1", None)
        .await
        .unwrap();

    assert!(inst.pending_audit.is_none());
    let history = executor.history("permit", "PRM-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].action_type, ActionType::Transition);
}

#[tokio::test]
async fn refused_entry_stays_pending_until_recovered() {
    let (executor, ledger) = setup(two_step()).await;
    let inst = executor
        .start_workflow("permit", "permit", "PRM-2", "clerk-1")
        .await
        .unwrap();

    ledger.refuse_next(3);
    let err = executor
        .complete_task(&inst.id, inst.version, "done", "clerk-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Audit(_)));

    // The transition is committed and the missing entry is carried with it.
    let stored = executor.get_instance(&inst.id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Completed);
    assert_eq!(stored.current_step, Some(StepId::new("sign_off")));
    assert_eq!(stored.version, 3);
    assert!(stored.pending_audit.is_some());
    assert_eq!(executor.history("permit", "PRM-2").await.unwrap().len(), 1);

    assert_eq!(executor.recover_pending_audits().await.unwrap(), 1);

    let history = executor.history("permit", "PRM-2").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].action_type, ActionType::Transition);
    assert_eq!(history[1].from_step.as_deref(), Some("intake"));
    assert_eq!(history[1].to_step.as_deref(), Some("sign_off"));
    assert!(executor.verify_chain("permit", "PRM-2").await.unwrap().is_intact());

    let repaired = executor.get_instance(&inst.id).await.unwrap();
    assert!(repaired.pending_audit.is_none());
    assert_eq!(executor.recover_pending_audits().await.unwrap(), 0);
}

#[tokio::test]
async fn next_transition_records_pending_entry_first() {
    let (executor, ledger) = setup(three_step()).await;
    let inst = executor
        .start_workflow("permit", "permit", "PRM-3", "clerk-1")
        .await
        .unwrap();

    ledger.refuse_next(3);
    executor
        .complete_task(&inst.id, inst.version, "done", "clerk-1", None)
        .await
        .unwrap_err();
    let marked = executor.get_instance(&inst.id).await.unwrap();
    assert!(marked.pending_audit.is_some());

    // While the ledger is still down the next transition is refused outright.
    ledger.refuse_next(1);
    let err = executor
        .complete_task(&marked.id, marked.version, "done", "inspector-4", None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Audit(_)));
    assert_eq!(executor.get_instance(&inst.id).await.unwrap(), marked);

    let done = executor
        .complete_task(&marked.id, marked.version, "done", "inspector-4", None)
        .await
        .unwrap();
    assert!(done.pending_audit.is_none());
    assert_eq!(done.current_step, Some(StepId::new("sign_off")));
    assert_eq!(done.status, InstanceStatus::Completed);

    let history = executor.history("permit", "PRM-3").await.unwrap();
    let path: Vec<_> = history
        .iter()
        .map(|e| (e.action_type, e.from_step.clone(), e.to_step.clone()))
        .collect();
    assert_eq!(
        path,
        vec![
            (ActionType::Create, None, Some("intake".to_string())),
            (ActionType::Transition, Some("intake".to_string()), Some("inspection".to_string())),
            (ActionType::Transition, Some("inspection".to_string()), Some("sign_off".to_string())),
        ]
    );
    assert!(executor.verify_chain("permit", "PRM-3").await.unwrap().is_intact());
}
