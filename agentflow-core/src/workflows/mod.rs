pub mod conditions;
pub mod executor;
pub mod paths;
pub mod registry;
pub mod state;
pub mod step_runner;
pub mod types;

pub use executor::{WorkflowExecutor, WorkflowExecutorConfig};
pub use registry::WorkflowRegistry;
pub use state::{ExecutionResult, ExecutionStatus, ExecutionStore};
pub use types::{OnError, RetryPolicy, WorkflowDefinition, WorkflowErrorPolicy, WorkflowStep};
