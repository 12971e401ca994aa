use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::behavior::Agent;

/// Id-keyed store of agents. Registration after startup is allowed, so the
/// map sits behind a lock shared across concurrent runs.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the agent under its own id, replacing any previous entry.
    pub async fn register(&self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_owned();
        self.agents.write().await.insert(id, agent);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
