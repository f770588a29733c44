//! Definition registry: validated, versioned workflow definitions
//!
//! Definitions are immutable once registered. Registering a definition under
//! an existing name creates the next version; instances keep referencing the
//! exact definition id they were started with.

use std::collections::HashMap;
use std::sync::Arc;
use workflow_storage::DefinitionStore;
use workflow_types::{WorkflowDefinition, WorkflowDefinitionId, WorkflowError, WorkflowResult};

/// Registry of workflow definitions
#[derive(Clone, Debug, Default)]
pub struct DefinitionRegistry {
    /// All registered definitions, keyed by ID
    definitions: HashMap<WorkflowDefinitionId, Arc<WorkflowDefinition>>,
    /// Index by name → definition IDs in version order
    by_name: HashMap<String, Vec<WorkflowDefinitionId>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition
    ///
    /// The stored version is one past the latest version registered under
    /// the same name (1 for a new name).
    pub fn register(
        &mut self,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let prepared = self.prepare(definition)?;
        self.insert(Arc::clone(&prepared));

        tracing::info!(
            definition_id = %prepared.id,
            name = %prepared.name,
            version = prepared.version,
            steps = prepared.step_count(),
            "Workflow definition registered"
        );
        Ok(prepared)
    }

    /// Register a definition and persist it before it becomes visible
    pub async fn register_and_persist(
        &mut self,
        definition: WorkflowDefinition,
        store: &dyn DefinitionStore,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let prepared = self.prepare(definition)?;
        store.save_definition(&prepared).await?;
        self.insert(Arc::clone(&prepared));

        tracing::info!(
            definition_id = %prepared.id,
            name = %prepared.name,
            version = prepared.version,
            "Workflow definition registered and persisted"
        );
        Ok(prepared)
    }

    /// Load every persisted definition, keeping stored versions.
    ///
    /// Returns how many definitions were added.
    pub async fn hydrate(&mut self, store: &dyn DefinitionStore) -> WorkflowResult<usize> {
        let mut added = 0;
        for definition in store.load_definitions().await? {
            if self.definitions.contains_key(&definition.id) {
                continue;
            }
            definition.validate()?;
            self.insert(Arc::new(definition));
            added += 1;
        }

        tracing::info!(definitions = added, "Workflow definitions hydrated");
        Ok(added)
    }

    fn prepare(&self, mut definition: WorkflowDefinition) -> WorkflowResult<Arc<WorkflowDefinition>> {
        definition.validate()?;

        if self.definitions.contains_key(&definition.id) {
            return Err(WorkflowError::invalid_definition(
                None,
                format!("definition id '{}' is already registered", definition.id),
            ));
        }

        definition.version = self
            .latest(&definition.name)
            .map(|latest| latest.version + 1)
            .unwrap_or(1);
        Ok(Arc::new(definition))
    }

    fn insert(&mut self, definition: Arc<WorkflowDefinition>) {
        let ids = self.by_name.entry(definition.name.clone()).or_default();
        ids.push(definition.id.clone());

        let definitions = &self.definitions;
        let version_of = |id: &WorkflowDefinitionId| {
            definitions
                .get(id)
                .map(|d| d.version)
                .unwrap_or(definition.version)
        };
        ids.sort_by_key(version_of);

        self.definitions.insert(definition.id.clone(), definition);
    }

    fn latest(&self, name: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.by_name
            .get(name)
            .and_then(|ids| ids.last())
            .and_then(|id| self.definitions.get(id))
    }

    /// Latest version of a definition by name
    pub fn get(&self, name: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.latest(name)
            .cloned()
            .ok_or_else(|| WorkflowError::DefinitionNotFound(name.to_string()))
    }

    /// A specific definition by id
    pub fn get_by_id(&self, id: &WorkflowDefinitionId) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::DefinitionNotFound(id.to_string()))
    }

    /// All versions registered under `name`, oldest first
    pub fn versions(&self, name: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.by_name
            .get(name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.definitions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest version of every registered name, sorted by name
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.latest(name).cloned())
            .collect()
    }

    /// Total number of registered definitions, counting every version
    pub fn count(&self) -> usize {
        self.definitions.len()
    }

    pub fn contains(&self, id: &WorkflowDefinitionId) -> bool {
        self.definitions.contains_key(id)
    }
}
