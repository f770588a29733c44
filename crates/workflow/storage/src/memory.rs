//! In-memory instance and definition store.
//!
//! All state sits behind one `RwLock`, which keeps the instance map and the
//! active-key index consistent with each other. No guard is held across an
//! `.await`.

use crate::traits::{ActiveKey, DefinitionStore, InstanceStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use workflow_types::{
    InstanceStatus, WorkflowDefinition, WorkflowDefinitionId, WorkflowError, WorkflowInstance,
    WorkflowInstanceId, WorkflowResult,
};

#[derive(Default)]
struct State {
    instances: HashMap<WorkflowInstanceId, WorkflowInstance>,
    active: HashMap<ActiveKey, WorkflowInstanceId>,
    definitions: HashMap<WorkflowDefinitionId, WorkflowDefinition>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    state: RwLock<State>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances, in any status
    pub fn len(&self) -> usize {
        self.read().map(|s| s.instances.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> WorkflowResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| WorkflowError::Storage("instance store lock poisoned".to_string()))
    }

    fn write(&self) -> WorkflowResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| WorkflowError::Storage("instance store lock poisoned".to_string()))
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: WorkflowInstance) -> WorkflowResult<WorkflowInstance> {
        let mut state = self.write()?;

        if state.instances.contains_key(&instance.id) {
            return Err(WorkflowError::Storage(format!(
                "instance {} already exists",
                instance.id
            )));
        }

        let key = ActiveKey::of(&instance);
        if instance.is_active() {
            if state.active.contains_key(&key) {
                return Err(key.duplicate());
            }
            state.active.insert(key, instance.id.clone());
        }
        state.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn load(&self, id: &WorkflowInstanceId) -> WorkflowResult<WorkflowInstance> {
        self.read()?
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))
    }

    async fn compare_and_swap(
        &self,
        id: &WorkflowInstanceId,
        expected_version: u64,
        mut new_state: WorkflowInstance,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut state = self.write()?;

        let current = state
            .instances
            .get(id)
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))?;

        if current.version != expected_version {
            return Err(WorkflowError::VersionConflict {
                id: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let key = ActiveKey::of(current);
        if new_state.id != *id || ActiveKey::of(&new_state) != key {
            return Err(WorkflowError::Storage(format!(
                "instance {} cannot change its identity or entity key",
                id
            )));
        }

        let was_active = current.is_active();
        if new_state.is_active() && !was_active {
            if let Some(holder) = state.active.get(&key) {
                if holder != id {
                    return Err(key.duplicate());
                }
            }
        }

        new_state.version = expected_version + 1;
        match (was_active, new_state.is_active()) {
            (true, false) => {
                state.active.remove(&key);
            }
            (false, true) => {
                state.active.insert(key, id.clone());
            }
            _ => {}
        }
        state.instances.insert(id.clone(), new_state.clone());
        Ok(new_state)
    }

    async fn find_active(&self, key: &ActiveKey) -> WorkflowResult<Option<WorkflowInstance>> {
        let state = self.read()?;
        Ok(state
            .active
            .get(key)
            .and_then(|id| state.instances.get(id))
            .cloned())
    }

    async fn list_by_status(&self, status: InstanceStatus) -> WorkflowResult<Vec<WorkflowInstance>> {
        let state = self.read()?;
        let mut found: Vec<WorkflowInstance> = state
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(found)
    }

    async fn list_audit_pending(&self) -> WorkflowResult<Vec<WorkflowInstance>> {
        let state = self.read()?;
        let mut found: Vec<WorkflowInstance> = state
            .instances
            .values()
            .filter(|i| i.pending_audit.is_some())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(found)
    }
}

#[async_trait]
impl DefinitionStore for InMemoryInstanceStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> WorkflowResult<()> {
        let mut state = self.write()?;
        state
            .definitions
            .entry(definition.id.clone())
            .or_insert_with(|| definition.clone());
        Ok(())
    }

    async fn load_definitions(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        let state = self.read()?;
        let mut definitions: Vec<WorkflowDefinition> = state.definitions.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(definitions)
    }
}
