use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::agents::behavior::{AgentExecutionResult, RunContext};
use crate::agents::registry::AgentRegistry;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::workflows::paths::{resolve_scoped, scope_root};
use crate::workflows::state::ExecutionState;
use crate::workflows::types::WorkflowStep;

/// Executes a single step: agent lookup, input mapping, and the bounded
/// retry loop. Never touches shared run variables; output mapping is the
/// coordinator's job.
pub struct StepRunner {
    agents: Arc<AgentRegistry>,
}

impl StepRunner {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }

    /// Returns `Err` only for executor-level failures: an unregistered agent
    /// or an attempt budget exhausted by `Err` responses. An `Ok` response
    /// with `success = false` is returned as-is and never retried.
    pub async fn run(
        &self,
        step: &WorkflowStep,
        state: &ExecutionState,
        context: &RunContext,
        event_tx: Option<&mpsc::Sender<Event>>,
    ) -> Result<AgentExecutionResult> {
        let agent = self.agents.get(&step.agent_id).await.ok_or_else(|| {
            Error::NotFound(format!("agent '{}' not found", step.agent_id))
        })?;

        let input = Self::step_input(step, state);
        let policy = step.retry_policy.unwrap_or_default();
        let total_attempts = policy.total_attempts();
        let mut last_error: Option<Error> = None;

        for attempt in 0..total_attempts {
            if attempt > 0 {
                let delay = policy.delay_before_attempt(attempt);
                let reason = last_error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                tracing::warn!(
                    step_id = %step.id,
                    agent_id = %step.agent_id,
                    attempt,
                    total_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "retrying step after failed attempt"
                );
                if let Some(tx) = event_tx {
                    let _ = tx.try_send(Event::StepRetry {
                        workflow_id: state.workflow_id.clone(),
                        execution_id: state.execution_id,
                        step_id: step.id.clone(),
                        attempt,
                        total_attempts,
                        backoff_ms: delay.as_millis() as u64,
                    });
                }
                sleep(delay).await;
            }

            let attempt_started = Instant::now();
            match agent.execute(input.clone(), context).await {
                Ok(response) => {
                    let tokens_used = response.tokens_used();
                    return Ok(AgentExecutionResult {
                        agent_id: step.agent_id.clone(),
                        response,
                        execution_time_ms: attempt_started.elapsed().as_millis() as u64,
                        tokens_used,
                    });
                }
                Err(err) => {
                    last_error = Some(err);
                }
            }
        }

        let detail = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt was made".to_owned());
        Err(Error::Agent(format!(
            "step '{}' failed after {} attempts: {}",
            step.id, total_attempts, detail
        )))
    }

    /// Input mapping builds a fresh object, target field by source path over
    /// the run scope; absent sources are omitted. Without a mapping the raw
    /// run input passes through unchanged.
    fn step_input(step: &WorkflowStep, state: &ExecutionState) -> Value {
        let Some(mapping) = &step.input_mapping else {
            return state.input.clone();
        };

        let root = scope_root(state);
        let mut input = Map::new();
        for (target, source) in mapping {
            if let Some(value) = resolve_scoped(&root, source) {
                input.insert(target.clone(), value);
            }
        }
        Value::Object(input)
    }
}
