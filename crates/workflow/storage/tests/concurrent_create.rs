//! Racing writers against the in-memory store: the active-key rule and CAS
//! both admit exactly one winner.

use std::sync::Arc;
use workflow_storage::{ActiveKey, InMemoryInstanceStore, InstanceStore};
use workflow_types::{InstanceStatus, Step, WorkflowDefinition, WorkflowError, WorkflowInstance};

fn definition() -> WorkflowDefinition {
    WorkflowDefinition::new("election_certification", "count")
        .with_step(Step::user_task("count", "returning_officer").then("certify"))
        .with_step(Step::user_task("certify", "commission").then_finish())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_admit_one_active_instance() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let def = Arc::new(definition());

    let mut handles = Vec::new();
    for clerk in 0..12 {
        let store = Arc::clone(&store);
        let def = Arc::clone(&def);
        handles.push(tokio::spawn(async move {
            let inst = WorkflowInstance::start(&def, "election", "EL-2024", format!("clerk-{clerk}"));
            store.create(inst).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(WorkflowError::DuplicateActiveInstance { .. }) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(duplicates, 11);

    let key = ActiveKey::new(def.id.clone(), "election", "EL-2024");
    assert!(store.find_active(&key).await.unwrap().is_some());
    assert_eq!(store.list_by_status(InstanceStatus::Active).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_swaps_on_one_version_admit_one_winner() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let def = definition();
    let inst = store
        .create(WorkflowInstance::start(&def, "election", "EL-2024", "clerk"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for writer in 0..8u32 {
        let store = Arc::clone(&store);
        let mut next = inst.clone();
        next.service_failures = writer;
        handles.push(tokio::spawn(async move {
            let id = next.id.clone();
            store.compare_and_swap(&id, 1, next).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(stored) => winners.push(stored),
            Err(WorkflowError::VersionConflict { expected: 1, actual: 2, .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = store.load(&inst.id).await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.service_failures, winners[0].service_failures);
}
