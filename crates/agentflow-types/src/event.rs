//! Event types for the workflow event bus.
//!
//! `WorkflowEvent` is broadcast while executions run and approvals resolve.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::ApprovalStatus;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
    },

    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
    },

    /// The execution parked on an approval gate.
    ExecutionSuspended {
        execution_id: Uuid,
        step_id: String,
        approval_id: Uuid,
    },

    ExecutionResumed {
        execution_id: Uuid,
        step_id: String,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        steps_executed: usize,
    },

    ExecutionFailed {
        execution_id: Uuid,
        workflow_id: String,
        error: String,
    },

    ApprovalRequested {
        approval_id: Uuid,
        execution_id: Uuid,
        step_id: String,
        approvers: Vec<String>,
    },

    ApprovalResolved {
        approval_id: Uuid,
        execution_id: Uuid,
        status: ApprovalStatus,
    },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::ExecutionSuspended { execution_id, .. }
            | Self::ExecutionResumed { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ApprovalRequested { execution_id, .. }
            | Self::ApprovalResolved { execution_id, .. } => *execution_id,
        }
    }
}
