//! Execution tracking types.
//!
//! An `Execution` is one run of a workflow from its entry step to a terminal
//! status. It is created when the run starts, mutated only by the executor
//! that owns it, and keeps partial progress even on failure.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    WaitingForApproval,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Terminal executions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting_for_approval" => Ok(Self::WaitingForApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Outcome of one visited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    WaitingForApproval,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingForApproval => "waiting_for_approval",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Result recorded for every step the executor visits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Per-branch outcomes of a parallel step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchResult>,
    /// Iterations run by a loop step, including skipped ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

impl StepExecutionResult {
    pub fn completed(step_id: &str, output: String, started_at: DateTime<Utc>) -> Self {
        Self::new(step_id, StepStatus::Completed, Some(output), None, started_at)
    }

    pub fn failed(step_id: &str, error: String, started_at: DateTime<Utc>) -> Self {
        Self::new(step_id, StepStatus::Failed, None, Some(error), started_at)
    }

    /// An approval step that parked its execution.
    pub fn waiting(step_id: &str, started_at: DateTime<Utc>) -> Self {
        Self::new(step_id, StepStatus::WaitingForApproval, None, None, started_at)
    }

    /// Settle a waiting result once its approval resolves. Duration covers
    /// the whole wait.
    pub fn settle(&mut self, status: StepStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
    }

    fn new(
        step_id: &str,
        status: StepStatus,
        output: Option<String>,
        error: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Self {
            step_id: step_id.to_string(),
            status,
            output,
            error,
            started_at,
            duration_ms,
            branches: Vec::new(),
            iterations: None,
        }
    }
}

/// Outcome of a single parallel branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    /// Zero-based position in the step's branch list.
    pub index: usize,
    pub agent_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: String,
    /// Correlation id of the durable run carrying this execution. Approval
    /// signals are addressed to it.
    pub run_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Input snapshot as received.
    pub input: String,
    /// Last non-empty step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Visited step ids in order.
    #[serde(default)]
    pub steps_executed: Vec<String>,
    #[serde(default)]
    pub step_results: HashMap<String, StepExecutionResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Saved interpreter state while waiting for approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<ExecutionCheckpoint>,
}

impl Execution {
    /// A fresh running execution.
    pub fn start(workflow_id: &str, run_id: String, input: &str, user_id: Option<&str>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            run_id,
            status: ExecutionStatus::Running,
            user_id: user_id.map(String::from),
            input: input.to_string(),
            output: None,
            error: None,
            steps_executed: Vec::new(),
            step_results: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            checkpoint: None,
        }
    }

    /// Move to a terminal status and stamp completion time.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.checkpoint = None;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    /// Append a step result, keeping `steps_executed` in visit order.
    pub fn record_step(&mut self, result: StepExecutionResult) {
        self.steps_executed.push(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
    }
}

/// Interpreter state persisted when an approval step suspends a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    /// The approval step the run is parked on.
    pub step_id: String,
    pub approval_id: Uuid,
    /// Steps visited so far, counted against the visit budget.
    pub visits: u32,
    /// Serialized variable namespace.
    pub namespace: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::WaitingForApproval,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::WaitingForApproval.is_terminal());
    }

    #[test]
    fn test_record_step_keeps_order() {
        let mut exec = Execution::start("wf", "run-1".to_string(), "hi", Some("u1"));
        exec.record_step(StepExecutionResult::completed("a", "x".into(), Utc::now()));
        exec.record_step(StepExecutionResult::failed("b", "boom".into(), Utc::now()));
        assert_eq!(exec.steps_executed, vec!["a", "b"]);
        assert_eq!(exec.step_results["b"].status, StepStatus::Failed);
        assert_eq!(exec.step_results["b"].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_finish_clears_checkpoint() {
        let mut exec = Execution::start("wf", "run-1".to_string(), "", None);
        exec.checkpoint = Some(ExecutionCheckpoint {
            step_id: "gate".into(),
            approval_id: Uuid::now_v7(),
            visits: 1,
            namespace: serde_json::json!({}),
        });
        exec.finish(ExecutionStatus::Completed, None);
        assert!(exec.checkpoint.is_none());
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.is_some());
    }
}
