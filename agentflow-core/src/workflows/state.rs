use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::behavior::AgentExecutionResult;
use crate::error::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Mutable working state of one run, owned exclusively by the run's task.
#[derive(Debug)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub input: Value,
    pub variables: BTreeMap<String, Value>,
    pub step_results: BTreeMap<String, AgentExecutionResult>,
    pub started_at: Instant,
    pub current_step: Option<String>,
}

impl ExecutionState {
    pub fn new(workflow_id: impl Into<String>, execution_id: Uuid, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            input,
            variables: BTreeMap::new(),
            step_results: BTreeMap::new(),
            started_at: Instant::now(),
            current_step: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub success: bool,
    pub output: BTreeMap<String, Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub step_results: BTreeMap<String, AgentExecutionResult>,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    pub fn pending(workflow_id: impl Into<String>, execution_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            status: ExecutionStatus::Pending,
            success: false,
            output: BTreeMap::new(),
            error: None,
            execution_time_ms: 0,
            step_results: BTreeMap::new(),
            completed_steps: Vec::new(),
            failed_step: None,
            finished_at: None,
        }
    }
}

struct StoreEntry {
    result: ExecutionResult,
    cancel: CancellationToken,
}

/// In-memory store of execution results, shared between running coordinators
/// and status/cancel callers. Contents do not survive the process.
#[derive(Default)]
pub struct ExecutionStore {
    executions: RwLock<HashMap<Uuid, StoreEntry>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run and hands back the token its coordinator polls
    /// between steps.
    pub async fn insert(&self, result: ExecutionResult) -> CancellationToken {
        let token = CancellationToken::new();
        let entry = StoreEntry {
            result: result.clone(),
            cancel: token.clone(),
        };
        self.executions
            .write()
            .await
            .insert(result.execution_id, entry);
        token
    }

    /// Records run progress. Writes to a cancelled entry are dropped so the
    /// cancellation outcome stays observable.
    pub async fn update(&self, result: ExecutionResult) {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&result.execution_id) {
            Some(entry) if entry.result.status != ExecutionStatus::Cancelled => {
                entry.result = result;
            }
            Some(_) => {}
            None => {
                let entry = StoreEntry {
                    result: result.clone(),
                    cancel: CancellationToken::new(),
                };
                executions.insert(result.execution_id, entry);
            }
        }
    }

    pub async fn status(&self, execution_id: Uuid) -> Option<ExecutionResult> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|entry| entry.result.clone())
    }

    /// Marks the execution cancelled and trips its token. The running
    /// coordinator notices before its next step; in-flight agent calls are
    /// not interrupted. Returns false for unknown ids.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let mut executions = self.executions.write().await;
        let Some(entry) = executions.get_mut(&execution_id) else {
            return false;
        };

        entry.cancel.cancel();
        entry.result.status = ExecutionStatus::Cancelled;
        entry.result.success = false;
        entry.result.error = Some(
            Error::Cancelled("execution cancelled by caller".to_owned()).to_string(),
        );
        entry.result.finished_at = Some(Utc::now());
        true
    }

    pub async fn cancellation_token(&self, execution_id: Uuid) -> Option<CancellationToken> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|entry| entry.cancel.clone())
    }

    pub async fn list(&self) -> Vec<Uuid> {
        self.executions.read().await.keys().copied().collect()
    }

    /// Drops terminal results that finished more than `max_age` ago. Live
    /// runs are kept regardless of age.
    pub async fn clear_finished_older_than(&self, max_age: std::time::Duration) {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let cutoff = Utc::now() - max_age;
        self.executions.write().await.retain(|_, entry| {
            if !entry.result.status.is_terminal() {
                return true;
            }
            match entry.result.finished_at {
                Some(finished_at) => finished_at >= cutoff,
                None => true,
            }
        });
    }
}
