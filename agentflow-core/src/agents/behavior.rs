use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;

/// Caller-supplied identity and tracing information, passed through to every
/// agent invocation of a run unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub session_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            user_id: None,
            tenant_id: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl AgentResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// A domain-level rejection. The step still counts as completed, but its
    /// output mapping is skipped.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Resource accounting reported by the agent, if any.
    pub fn tokens_used(&self) -> u64 {
        self.metadata
            .get("tokens_used")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Outcome of a single step invocation, recorded per step id on the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub agent_id: String,
    pub response: AgentResponse,
    pub execution_time_ms: u64,
    pub tokens_used: u64,
}

/// The pluggable unit of work a workflow step delegates to.
///
/// An `Err` marks the attempt as failed and is subject to the step's retry
/// policy. An `Ok` response with `success = false` is final for the step.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, input: Value, context: &RunContext) -> Result<AgentResponse>;
}
