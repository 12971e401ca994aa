use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    pub error_policy: Option<WorkflowErrorPolicy>,
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            version: "1.0.0".to_owned(),
            steps: Vec::new(),
            error_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    /// Target field in the step input, keyed to a source path over the run
    /// scope. Absent mapping passes the raw run input through unchanged.
    pub input_mapping: Option<BTreeMap<String, String>>,
    /// Source path over `{ "data": <response data> }`, keyed to the shared
    /// variable name it writes.
    pub output_mapping: Option<BTreeMap<String, String>>,
    pub condition: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Deterministic backoff before attempt `n` (the first attempt is 0 and
    /// waits nothing): `initial_delay_ms * backoff_multiplier^(n - 1)`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let scaled = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u64
        } else {
            self.initial_delay_ms
        };
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowErrorPolicy {
    pub on_error: OnError,
    pub fallback_steps: Vec<String>,
    pub max_execution_time_ms: u64,
}

impl Default for WorkflowErrorPolicy {
    fn default() -> Self {
        Self {
            on_error: OnError::default(),
            fallback_steps: Vec::new(),
            max_execution_time_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Stop,
    #[default]
    Continue,
    /// Step-level retries have already run by the time the policy applies, so
    /// this behaves as `Continue`.
    Retry,
    Fallback,
}
