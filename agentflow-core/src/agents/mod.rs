pub mod behavior;
pub mod registry;

pub use behavior::{Agent, AgentExecutionResult, AgentResponse, RunContext};
pub use registry::AgentRegistry;
