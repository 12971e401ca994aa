use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::WorkflowDefinition;

/// Id-keyed store of workflow definitions. Re-registration replaces the
/// whole definition atomically; runs already holding the previous `Arc`
/// finish against it.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, workflow: WorkflowDefinition) {
        let id = workflow.id.clone();
        self.workflows.write().await.insert(id, Arc::new(workflow));
    }

    pub async fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
