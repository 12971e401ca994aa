use uuid::Uuid;

/// Run lifecycle notifications, delivered best-effort; a full or absent
/// channel never affects execution.
#[derive(Debug, Clone)]
pub enum Event {
    WorkflowStarted {
        workflow_id: String,
        execution_id: Uuid,
    },
    StepStarted {
        workflow_id: String,
        execution_id: Uuid,
        step_id: String,
    },
    StepCompleted {
        workflow_id: String,
        execution_id: Uuid,
        step_id: String,
        success: bool,
    },
    StepSkipped {
        workflow_id: String,
        execution_id: Uuid,
        step_id: String,
        condition: String,
    },
    StepRetry {
        workflow_id: String,
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        total_attempts: u32,
        backoff_ms: u64,
    },
    WorkflowTimeout {
        workflow_id: String,
        execution_id: Uuid,
        elapsed_ms: u64,
        limit_ms: u64,
    },
    WorkflowCompleted {
        workflow_id: String,
        execution_id: Uuid,
        success: bool,
        steps_completed: usize,
    },
}
