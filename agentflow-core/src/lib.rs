pub mod agents;
pub mod error;
pub mod events;
pub mod logging;
pub mod workflows;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use agents::{Agent, AgentExecutionResult, AgentResponse, AgentRegistry, RunContext};
pub use error::{Error, Result};
pub use events::Event;
pub use workflows::{
    ExecutionResult, ExecutionStatus, ExecutionStore, OnError, RetryPolicy, WorkflowDefinition,
    WorkflowErrorPolicy, WorkflowExecutor, WorkflowExecutorConfig, WorkflowRegistry, WorkflowStep,
};

/// Wires the registries, executor, and execution store together behind one
/// handle. Cheap to share: clone the `Arc`s it hands out or wrap the whole
/// thing in one.
pub struct Orchestrator {
    workflows: Arc<WorkflowRegistry>,
    agents: Arc<AgentRegistry>,
    store: Arc<ExecutionStore>,
    executor: WorkflowExecutor,
}

impl Orchestrator {
    pub fn new(config: WorkflowExecutorConfig) -> Self {
        let workflows = Arc::new(WorkflowRegistry::new());
        let agents = Arc::new(AgentRegistry::new());
        let store = Arc::new(ExecutionStore::new());
        let executor =
            WorkflowExecutor::new(workflows.clone(), agents.clone(), store.clone(), config);
        Self {
            workflows,
            agents,
            store,
            executor,
        }
    }

    pub fn with_event_sender(config: WorkflowExecutorConfig, event_tx: mpsc::Sender<Event>) -> Self {
        let workflows = Arc::new(WorkflowRegistry::new());
        let agents = Arc::new(AgentRegistry::new());
        let store = Arc::new(ExecutionStore::new());
        let executor =
            WorkflowExecutor::new(workflows.clone(), agents.clone(), store.clone(), config)
                .with_event_sender(event_tx);
        Self {
            workflows,
            agents,
            store,
            executor,
        }
    }

    pub async fn register_workflow(&self, definition: WorkflowDefinition) {
        self.workflows.register(definition).await;
    }

    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.agents.register(agent).await;
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        context: RunContext,
    ) -> ExecutionResult {
        self.executor.execute_workflow(workflow_id, input, context).await
    }

    pub async fn status(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.store.status(execution_id).await
    }

    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        self.store.cancel(execution_id).await
    }

    pub async fn workflows(&self) -> Vec<String> {
        self.workflows.list().await
    }

    pub async fn agents(&self) -> Vec<String> {
        self.agents.list().await
    }

    pub async fn clear_finished_older_than(&self, max_age: std::time::Duration) {
        self.store.clear_finished_older_than(max_age).await;
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(WorkflowExecutorConfig::default())
    }
}
