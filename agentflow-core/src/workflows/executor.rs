use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::agents::behavior::{AgentExecutionResult, RunContext};
use crate::agents::registry::AgentRegistry;
use crate::error::Error;
use crate::events::Event;
use crate::workflows::conditions::evaluate_condition;
use crate::workflows::paths::{resolve_path, scope_root};
use crate::workflows::registry::WorkflowRegistry;
use crate::workflows::state::{ExecutionResult, ExecutionState, ExecutionStatus, ExecutionStore};
use crate::workflows::step_runner::StepRunner;
use crate::workflows::types::{OnError, WorkflowDefinition, WorkflowErrorPolicy, WorkflowStep};

#[derive(Debug, Clone)]
pub struct WorkflowExecutorConfig {
    /// Applies when a definition carries no error policy of its own.
    pub default_max_execution_time_ms: u64,
}

impl Default for WorkflowExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_execution_time_ms: 300_000,
        }
    }
}

/// Drives one workflow run at a time: condition gating, step delegation,
/// shared variable updates, error policy, global timeout, and store updates.
pub struct WorkflowExecutor {
    workflows: Arc<WorkflowRegistry>,
    store: Arc<ExecutionStore>,
    step_runner: StepRunner,
    event_tx: Option<mpsc::Sender<Event>>,
    config: WorkflowExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        agents: Arc<AgentRegistry>,
        store: Arc<ExecutionStore>,
        config: WorkflowExecutorConfig,
    ) -> Self {
        Self {
            workflows,
            store,
            step_runner: StepRunner::new(agents),
            event_tx: None,
            config,
        }
    }

    pub fn with_event_sender(mut self, event_tx: mpsc::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Runs a registered workflow to completion. Infallible by signature:
    /// every failure kind, including an unknown workflow id, comes back as
    /// data on the result.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        context: RunContext,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let mut result = ExecutionResult::pending(workflow_id, execution_id);
        let cancel = self.store.insert(result.clone()).await;
        let started_at = Instant::now();

        let Some(definition) = self.workflows.get(workflow_id).await else {
            result.status = ExecutionStatus::Failed;
            result.error = Some(
                Error::NotFound(format!("workflow '{workflow_id}' not found")).to_string(),
            );
            result.execution_time_ms = started_at.elapsed().as_millis() as u64;
            result.finished_at = Some(Utc::now());
            self.store.update(result.clone()).await;
            return result;
        };

        let policy = definition.error_policy.clone().unwrap_or(WorkflowErrorPolicy {
            max_execution_time_ms: self.config.default_max_execution_time_ms,
            ..WorkflowErrorPolicy::default()
        });

        result.status = ExecutionStatus::Running;
        self.store.update(result.clone()).await;
        self.send(Event::WorkflowStarted {
            workflow_id: workflow_id.to_owned(),
            execution_id,
        });
        tracing::info!(
            workflow_id,
            %execution_id,
            steps = definition.steps.len(),
            "workflow started"
        );

        let mut state = ExecutionState::new(workflow_id, execution_id, input);
        let mut timed_out = false;

        for step in &definition.steps {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(condition) = &step.condition {
                let root = scope_root(&state);
                if !evaluate_condition(condition, &root) {
                    tracing::debug!(step_id = %step.id, %condition, "step skipped by condition");
                    self.send(Event::StepSkipped {
                        workflow_id: workflow_id.to_owned(),
                        execution_id,
                        step_id: step.id.clone(),
                        condition: condition.clone(),
                    });
                    continue;
                }
            }

            state.current_step = Some(step.id.clone());
            self.send(Event::StepStarted {
                workflow_id: workflow_id.to_owned(),
                execution_id,
                step_id: step.id.clone(),
            });

            match self
                .step_runner
                .run(step, &state, &context, self.event_tx.as_ref())
                .await
            {
                Ok(record) => {
                    let succeeded = record.response.success;
                    if succeeded {
                        Self::apply_output_mapping(step, &record, &mut state);
                    }
                    Self::record_step(step.id.clone(), record, &mut state, &mut result);
                    self.send(Event::StepCompleted {
                        workflow_id: workflow_id.to_owned(),
                        execution_id,
                        step_id: step.id.clone(),
                        success: succeeded,
                    });
                }
                Err(err) => {
                    tracing::warn!(step_id = %step.id, error = %err, "step failed");
                    result.failed_step = Some(step.id.clone());
                    result.error = Some(err.to_string());
                    self.send(Event::StepCompleted {
                        workflow_id: workflow_id.to_owned(),
                        execution_id,
                        step_id: step.id.clone(),
                        success: false,
                    });

                    match policy.on_error {
                        OnError::Stop => {
                            state.current_step = None;
                            break;
                        }
                        // Step-level retries already ran inside the step
                        // runner, so Retry degenerates to Continue here.
                        OnError::Continue | OnError::Retry => {}
                        OnError::Fallback => {
                            self.run_fallback_steps(
                                &definition,
                                &policy,
                                &mut state,
                                &mut result,
                                &context,
                            )
                            .await;
                        }
                    }
                }
            }
            state.current_step = None;

            let elapsed = started_at.elapsed();
            if elapsed >= Duration::from_millis(policy.max_execution_time_ms) {
                result.error = Some(
                    Error::Timeout(format!(
                        "workflow '{}' exceeded {} ms",
                        workflow_id, policy.max_execution_time_ms
                    ))
                    .to_string(),
                );
                timed_out = true;
                self.send(Event::WorkflowTimeout {
                    workflow_id: workflow_id.to_owned(),
                    execution_id,
                    elapsed_ms: elapsed.as_millis() as u64,
                    limit_ms: policy.max_execution_time_ms,
                });
                break;
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled && result.error.is_none() {
            result.error =
                Some(Error::Cancelled("execution cancelled by caller".to_owned()).to_string());
        }

        result.success = !result.completed_steps.is_empty() && result.error.is_none();
        result.status = if cancelled {
            ExecutionStatus::Cancelled
        } else if timed_out {
            ExecutionStatus::TimedOut
        } else if result.success {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        result.output = state.variables.clone();
        result.execution_time_ms = started_at.elapsed().as_millis() as u64;
        result.finished_at = Some(Utc::now());

        self.store.update(result.clone()).await;
        self.send(Event::WorkflowCompleted {
            workflow_id: workflow_id.to_owned(),
            execution_id,
            success: result.success,
            steps_completed: result.completed_steps.len(),
        });
        tracing::info!(
            workflow_id,
            %execution_id,
            success = result.success,
            status = ?result.status,
            steps_completed = result.completed_steps.len(),
            "workflow finished"
        );

        result
    }

    /// Runs the policy's fallback chain after a primary step failure. A
    /// failing fallback step aborts the remaining chain only; the primary
    /// sequence resumes afterwards.
    async fn run_fallback_steps(
        &self,
        definition: &WorkflowDefinition,
        policy: &WorkflowErrorPolicy,
        state: &mut ExecutionState,
        result: &mut ExecutionResult,
        context: &RunContext,
    ) {
        for fallback_id in &policy.fallback_steps {
            let Some(step) = definition.steps.iter().find(|s| s.id == *fallback_id) else {
                tracing::warn!(step_id = %fallback_id, "fallback step not defined, skipping");
                continue;
            };

            self.send(Event::StepStarted {
                workflow_id: state.workflow_id.clone(),
                execution_id: state.execution_id,
                step_id: step.id.clone(),
            });

            match self
                .step_runner
                .run(step, state, context, self.event_tx.as_ref())
                .await
            {
                Ok(record) => {
                    let succeeded = record.response.success;
                    if succeeded {
                        Self::apply_output_mapping(step, &record, state);
                    }
                    Self::record_step(step.id.clone(), record, state, result);
                    self.send(Event::StepCompleted {
                        workflow_id: state.workflow_id.clone(),
                        execution_id: state.execution_id,
                        step_id: step.id.clone(),
                        success: succeeded,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        step_id = %step.id,
                        error = %err,
                        "fallback step failed, aborting fallback chain"
                    );
                    self.send(Event::StepCompleted {
                        workflow_id: state.workflow_id.clone(),
                        execution_id: state.execution_id,
                        step_id: step.id.clone(),
                        success: false,
                    });
                    break;
                }
            }
        }
    }

    /// Output mapping reads source paths over `{ "data": <response data> }`
    /// and writes the resolved values into shared variables. Skipped
    /// entirely for unsuccessful responses.
    fn apply_output_mapping(
        step: &WorkflowStep,
        record: &AgentExecutionResult,
        state: &mut ExecutionState,
    ) {
        let Some(mapping) = &step.output_mapping else {
            return;
        };

        let root = json!({ "data": record.response.data.clone().unwrap_or(Value::Null) });
        for (source, variable) in mapping {
            if let Some(value) = resolve_path(&root, source) {
                state.variables.insert(variable.clone(), value);
            }
        }
    }

    fn record_step(
        step_id: String,
        record: AgentExecutionResult,
        state: &mut ExecutionState,
        result: &mut ExecutionResult,
    ) {
        state.step_results.insert(step_id.clone(), record.clone());
        result.step_results.insert(step_id.clone(), record);
        if !result.completed_steps.contains(&step_id) {
            result.completed_steps.push(step_id);
        }
    }

    fn send(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::behavior::{Agent, AgentResponse};
    use crate::workflows::types::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct StaticAgent {
        id: String,
        response: AgentResponse,
        seen_inputs: Mutex<Vec<Value>>,
    }

    impl StaticAgent {
        fn ok(id: &str, data: Value) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                response: AgentResponse::ok(data),
                seen_inputs: Mutex::new(Vec::new()),
            })
        }

        fn rejecting(id: &str, error: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                response: AgentResponse::rejected(error),
                seen_inputs: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen_inputs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Agent for StaticAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, input: Value, _context: &RunContext) -> crate::error::Result<AgentResponse> {
            self.seen_inputs.lock().unwrap().push(input);
            Ok(self.response.clone())
        }
    }

    struct FailingAgent {
        id: String,
    }

    #[async_trait]
    impl Agent for FailingAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: Value, _context: &RunContext) -> crate::error::Result<AgentResponse> {
            Err(Error::Agent("deliberate failure".to_owned()))
        }
    }

    struct SlowAgent {
        id: String,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for SlowAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: Value, _context: &RunContext) -> crate::error::Result<AgentResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(AgentResponse::ok(json!("slow done")))
        }
    }

    /// Cancels its own run through the store, as an external caller would.
    struct CancellingAgent {
        id: String,
        store: Arc<ExecutionStore>,
    }

    #[async_trait]
    impl Agent for CancellingAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _input: Value, _context: &RunContext) -> crate::error::Result<AgentResponse> {
            for execution_id in self.store.list().await {
                self.store.cancel(execution_id).await;
            }
            Ok(AgentResponse::ok(json!("cancelled myself")))
        }
    }

    struct Harness {
        workflows: Arc<WorkflowRegistry>,
        agents: Arc<AgentRegistry>,
        store: Arc<ExecutionStore>,
        executor: WorkflowExecutor,
    }

    fn harness() -> Harness {
        let workflows = Arc::new(WorkflowRegistry::new());
        let agents = Arc::new(AgentRegistry::new());
        let store = Arc::new(ExecutionStore::new());
        let executor = WorkflowExecutor::new(
            workflows.clone(),
            agents.clone(),
            store.clone(),
            WorkflowExecutorConfig::default(),
        );
        Harness {
            workflows,
            agents,
            store,
            executor,
        }
    }

    fn context() -> RunContext {
        RunContext::new("session", "corr")
    }

    fn step(id: &str, agent_id: &str) -> WorkflowStep {
        WorkflowStep {
            id: id.to_owned(),
            agent_id: agent_id.to_owned(),
            // Failure tests should not sit through the default backoff.
            retry_policy: Some(RetryPolicy {
                max_retries: 0,
                backoff_multiplier: 1.0,
                initial_delay_ms: 0,
            }),
            ..WorkflowStep::default()
        }
    }

    fn definition(id: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_owned(),
            steps,
            ..WorkflowDefinition::default()
        }
    }

    fn policy(on_error: OnError) -> Option<WorkflowErrorPolicy> {
        Some(WorkflowErrorPolicy {
            on_error,
            ..WorkflowErrorPolicy::default()
        })
    }

    #[tokio::test]
    async fn full_run_completes_steps_in_order() {
        let h = harness();
        h.agents.register(StaticAgent::ok("a1", json!({"x": 1}))).await;
        h.agents.register(StaticAgent::ok("a2", json!({"x": 2}))).await;
        h.agents.register(StaticAgent::ok("a3", json!({"x": 3}))).await;
        h.workflows
            .register(definition(
                "wf",
                vec![step("first", "a1"), step("second", "a2"), step("third", "a3")],
            ))
            .await;

        let result = h
            .executor
            .execute_workflow("wf", json!({"q": "go"}), context())
            .await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(
            result.completed_steps,
            vec!["first".to_owned(), "second".to_owned(), "third".to_owned()]
        );
        assert!(result.error.is_none());
        assert!(result.failed_step.is_none());
        assert_eq!(result.step_results.len(), 3);

        let stored = h.store.status(result.execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn output_mapping_feeds_later_input_mapping() {
        let h = harness();
        let login = StaticAgent::ok("login", json!({"token": "abc", "ttl": 60}));
        let fetch = StaticAgent::ok("fetch", json!({"rows": 3}));
        h.agents.register(login.clone()).await;
        h.agents.register(fetch.clone()).await;

        let mut first = step("login", "login");
        let mut output_mapping = BTreeMap::new();
        output_mapping.insert("data.token".to_owned(), "auth_token".to_owned());
        first.output_mapping = Some(output_mapping);

        let mut second = step("fetch", "fetch");
        let mut input_mapping = BTreeMap::new();
        input_mapping.insert("token".to_owned(), "auth_token".to_owned());
        second.input_mapping = Some(input_mapping);

        h.workflows
            .register(definition("wf", vec![first, second]))
            .await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(result.success);
        assert_eq!(result.output.get("auth_token"), Some(&json!("abc")));
        assert_eq!(
            fetch.seen_inputs.lock().unwrap()[0],
            json!({"token": "abc"})
        );
    }

    #[tokio::test]
    async fn false_condition_skips_step() {
        let h = harness();
        let classify = StaticAgent::ok("classify", json!({"flagged": false}));
        let escalate = StaticAgent::ok("escalate", json!("escalated"));
        let respond = StaticAgent::ok("respond", json!("answered"));
        h.agents.register(classify.clone()).await;
        h.agents.register(escalate.clone()).await;
        h.agents.register(respond.clone()).await;

        let mut first = step("classify", "classify");
        let mut output_mapping = BTreeMap::new();
        output_mapping.insert("data.flagged".to_owned(), "flagged".to_owned());
        first.output_mapping = Some(output_mapping);

        let mut second = step("escalate", "escalate");
        second.condition = Some("${flagged} == true".to_owned());

        h.workflows
            .register(definition(
                "wf",
                vec![first, second, step("respond", "respond")],
            ))
            .await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(result.success);
        assert_eq!(
            result.completed_steps,
            vec!["classify".to_owned(), "respond".to_owned()]
        );
        assert_eq!(escalate.calls(), 0);
    }

    #[tokio::test]
    async fn missing_condition_variable_runs_step() {
        let h = harness();
        let gated = StaticAgent::ok("gated", json!("ran"));
        h.agents.register(gated.clone()).await;

        let mut only = step("gated", "gated");
        only.condition = Some("${missing.flag} == true".to_owned());
        h.workflows.register(definition("wf", vec![only])).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert_eq!(gated.calls(), 1);
        assert_eq!(result.completed_steps, vec!["gated".to_owned()]);
    }

    #[tokio::test]
    async fn stop_policy_halts_remaining_steps() {
        let h = harness();
        let after = StaticAgent::ok("after", json!("never"));
        h.agents.register(StaticAgent::ok("ok", json!("fine"))).await;
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(after.clone()).await;

        let mut definition = definition(
            "wf",
            vec![step("first", "ok"), step("second", "broken"), step("third", "after")],
        );
        definition.error_policy = policy(OnError::Stop);
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.completed_steps, vec!["first".to_owned()]);
        assert_eq!(result.failed_step.as_deref(), Some("second"));
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn continue_policy_runs_remaining_steps() {
        let h = harness();
        let after = StaticAgent::ok("after", json!("still ran"));
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(after.clone()).await;

        let mut definition =
            definition("wf", vec![step("first", "broken"), step("second", "after")]);
        definition.error_policy = policy(OnError::Continue);
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        // The later step ran, but the recorded failure still fails the run.
        assert!(!result.success);
        assert_eq!(result.completed_steps, vec!["second".to_owned()]);
        assert_eq!(result.failed_step.as_deref(), Some("first"));
        assert!(result.error.is_some());
        assert_eq!(after.calls(), 1);
    }

    #[tokio::test]
    async fn retry_policy_moves_to_next_step() {
        let h = harness();
        let after = StaticAgent::ok("after", json!("ran"));
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(after.clone()).await;

        let mut definition =
            definition("wf", vec![step("first", "broken"), step("second", "after")]);
        definition.error_policy = policy(OnError::Retry);
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert_eq!(result.completed_steps, vec!["second".to_owned()]);
        assert_eq!(result.failed_step.as_deref(), Some("first"));
        assert_eq!(after.calls(), 1);
    }

    #[tokio::test]
    async fn fallback_policy_runs_fallback_chain() {
        let h = harness();
        let recover = StaticAgent::ok("recover", json!("recovered"));
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(recover.clone()).await;
        h.agents.register(StaticAgent::ok("wrap", json!("done"))).await;

        let mut definition = definition(
            "wf",
            vec![
                step("risky", "broken"),
                step("recover", "recover"),
                step("wrap", "wrap"),
            ],
        );
        definition.error_policy = Some(WorkflowErrorPolicy {
            on_error: OnError::Fallback,
            fallback_steps: vec!["recover".to_owned()],
            ..WorkflowErrorPolicy::default()
        });
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert_eq!(result.failed_step.as_deref(), Some("risky"));
        assert!(result.completed_steps.contains(&"recover".to_owned()));
        assert!(result.completed_steps.contains(&"wrap".to_owned()));
        // Deduplicated even though the fallback step also ran as a primary.
        assert_eq!(
            result
                .completed_steps
                .iter()
                .filter(|id| id.as_str() == "recover")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_fallback_aborts_chain_only() {
        let h = harness();
        let second_fallback = StaticAgent::ok("plan-c", json!("unused"));
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(second_fallback.clone()).await;
        h.agents.register(StaticAgent::ok("wrap", json!("done"))).await;

        let mut definition = definition(
            "wf",
            vec![
                step("risky", "broken"),
                step("plan-c", "plan-c"),
                step("wrap", "wrap"),
            ],
        );
        definition.error_policy = Some(WorkflowErrorPolicy {
            on_error: OnError::Fallback,
            // First fallback id references the failing step itself, so the
            // chain aborts before reaching plan-c.
            fallback_steps: vec!["risky".to_owned(), "plan-c".to_owned()],
            ..WorkflowErrorPolicy::default()
        });
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        // plan-c ran once as a primary step, never through the aborted chain.
        assert_eq!(second_fallback.calls(), 1);
        assert!(result.completed_steps.contains(&"plan-c".to_owned()));
        assert!(result.completed_steps.contains(&"wrap".to_owned()));
    }

    #[tokio::test]
    async fn unknown_fallback_id_is_skipped() {
        let h = harness();
        let recover = StaticAgent::ok("recover", json!("recovered"));
        h.agents
            .register(Arc::new(FailingAgent { id: "broken".to_owned() }))
            .await;
        h.agents.register(recover.clone()).await;

        let mut definition = definition(
            "wf",
            vec![step("risky", "broken"), step("recover", "recover")],
        );
        definition.error_policy = Some(WorkflowErrorPolicy {
            on_error: OnError::Fallback,
            fallback_steps: vec!["no-such-step".to_owned(), "recover".to_owned()],
            ..WorkflowErrorPolicy::default()
        });
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(result.completed_steps.contains(&"recover".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_step_halts_run() {
        let h = harness();
        let after = StaticAgent::ok("after", json!("never"));
        h.agents
            .register(Arc::new(SlowAgent {
                id: "slow".to_owned(),
                delay: Duration::from_millis(400),
            }))
            .await;
        h.agents.register(after.clone()).await;

        let mut definition =
            definition("wf", vec![step("crawl", "slow"), step("next", "after")]);
        definition.error_policy = Some(WorkflowErrorPolicy {
            max_execution_time_ms: 200,
            ..WorkflowErrorPolicy::default()
        });
        h.workflows.register(definition).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.error.unwrap().contains("timeout"));
        assert_eq!(result.completed_steps, vec!["crawl".to_owned()]);
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn rejected_response_completes_without_output_mapping() {
        let h = harness();
        let strict = StaticAgent::rejecting("strict", "out of scope");
        h.agents.register(strict.clone()).await;

        let mut only = step("screen", "strict");
        let mut output_mapping = BTreeMap::new();
        output_mapping.insert("data.verdict".to_owned(), "verdict".to_owned());
        only.output_mapping = Some(output_mapping);
        h.workflows.register(definition("wf", vec![only])).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        // A domain rejection completes the step but writes no variables.
        assert_eq!(result.completed_steps, vec!["screen".to_owned()]);
        assert!(result.output.is_empty());
        assert!(!result.step_results["screen"].response.success);
        assert!(result.success);
    }

    #[tokio::test]
    async fn unknown_workflow_is_failed_result() {
        let h = harness();

        let result = h
            .executor
            .execute_workflow("ghost", json!({}), context())
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("not found"));
        assert!(result.completed_steps.is_empty());
        assert!(h.store.status(result.execution_id).await.is_some());
    }

    #[tokio::test]
    async fn empty_workflow_fails() {
        let h = harness();
        h.workflows.register(definition("wf", Vec::new())).await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_step() {
        let h = harness();
        let after = StaticAgent::ok("after", json!("never"));
        h.agents
            .register(Arc::new(CancellingAgent {
                id: "saboteur".to_owned(),
                store: h.store.clone(),
            }))
            .await;
        h.agents.register(after.clone()).await;

        h.workflows
            .register(definition(
                "wf",
                vec![step("first", "saboteur"), step("second", "after")],
            ))
            .await;

        let result = h
            .executor
            .execute_workflow("wf", json!({}), context())
            .await;

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cancelled"));
        assert_eq!(after.calls(), 0);

        let stored = h.store.status(result.execution_id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn events_are_delivered_best_effort() {
        let (tx, mut rx) = mpsc::channel(64);
        let h = harness();
        let executor = WorkflowExecutor::new(
            h.workflows.clone(),
            h.agents.clone(),
            h.store.clone(),
            WorkflowExecutorConfig::default(),
        )
        .with_event_sender(tx);

        h.agents.register(StaticAgent::ok("a1", json!("x"))).await;
        h.workflows
            .register(definition("wf", vec![step("only", "a1")]))
            .await;

        let result = executor.execute_workflow("wf", json!({}), context()).await;
        assert!(result.success);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                Event::WorkflowStarted { .. } => "started",
                Event::StepStarted { .. } => "step_started",
                Event::StepCompleted { .. } => "step_completed",
                Event::WorkflowCompleted { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["started", "step_started", "step_completed", "completed"]
        );
    }
}
