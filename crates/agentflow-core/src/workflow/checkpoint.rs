//! Durable checkpoints for executions.
//!
//! Wraps `WorkflowRepository` with the operations the executor needs:
//! create the record at start, save it after every step, and park it with a
//! serialized namespace when an approval gate suspends the run. A parked
//! record is everything `resume` needs, so a suspension survives a process
//! restart.

use std::sync::Arc;

use agentflow_types::execution::{Execution, ExecutionCheckpoint, ExecutionStatus};
use uuid::Uuid;

use crate::repository::WorkflowRepository;

use super::namespace::Namespace;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists execution state transitions before the executor moves on.
pub struct CheckpointManager<W: WorkflowRepository> {
    repo: Arc<W>,
}

impl<W: WorkflowRepository> CheckpointManager<W> {
    pub fn new(repo: Arc<W>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &W {
        &self.repo
    }

    pub async fn create(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .create_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(execution_id = %execution.id, "checkpointed execution start");
        Ok(())
    }

    /// Save progress after a step.
    pub async fn save(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .update_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            steps = execution.steps_executed.len(),
            "checkpointed execution"
        );
        Ok(())
    }

    /// Park the execution on an approval step.
    pub async fn suspend(
        &self,
        execution: &mut Execution,
        step_id: &str,
        approval_id: Uuid,
        visits: u32,
        namespace: &Namespace,
    ) -> Result<(), CheckpointError> {
        execution.status = ExecutionStatus::WaitingForApproval;
        execution.checkpoint = Some(ExecutionCheckpoint {
            step_id: step_id.to_string(),
            approval_id,
            visits,
            namespace: namespace.to_json(),
        });
        self.save(execution).await
    }

    pub async fn load(&self, execution_id: Uuid) -> Result<Option<Execution>, CheckpointError> {
        self.repo
            .get_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Rebuild the namespace saved by `suspend`.
    pub fn restore_namespace(checkpoint: &ExecutionCheckpoint) -> Result<Namespace, CheckpointError> {
        Namespace::from_json(checkpoint.namespace.clone())
            .map_err(|e| CheckpointError::Corrupt(format!("namespace: {e}")))
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::test_support::MemoryWorkflowRepository;

    #[tokio::test]
    async fn suspend_then_restore_round_trips_namespace() {
        let repo = Arc::new(MemoryWorkflowRepository::default());
        let manager = CheckpointManager::new(Arc::clone(&repo));

        let mut execution = Execution::start("wf", "wf/run".to_string(), "hello", Some("alice"));
        manager.create(&execution).await.unwrap();

        let mut context = Map::new();
        context.insert("tone".to_string(), json!("formal"));
        let mut ns = Namespace::new("hello", context);
        ns.record_output("draft", "first draft");

        let approval_id = Uuid::now_v7();
        manager
            .suspend(&mut execution, "review", approval_id, 3, &ns)
            .await
            .unwrap();

        let loaded = manager.load(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::WaitingForApproval);
        let checkpoint = loaded.checkpoint.unwrap();
        assert_eq!(checkpoint.step_id, "review");
        assert_eq!(checkpoint.approval_id, approval_id);
        assert_eq!(checkpoint.visits, 3);

        let restored = CheckpointManager::<MemoryWorkflowRepository>::restore_namespace(&checkpoint).unwrap();
        assert_eq!(restored.previous(), Some("first draft"));
        assert_eq!(restored.resolve("${context.tone}"), "formal");
    }

    #[tokio::test]
    async fn save_unknown_execution_fails() {
        let manager = CheckpointManager::new(Arc::new(MemoryWorkflowRepository::default()));
        let execution = Execution::start("wf", "wf/run".to_string(), "", None);
        let err = manager.save(&execution).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Repository(_)));
    }

    #[test]
    fn corrupt_namespace_is_reported() {
        let checkpoint = ExecutionCheckpoint {
            step_id: "gate".to_string(),
            approval_id: Uuid::now_v7(),
            visits: 1,
            namespace: json!("not an object"),
        };
        let err = CheckpointManager::<MemoryWorkflowRepository>::restore_namespace(&checkpoint).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("corrupt checkpoint"), "got: {msg}");
    }
}
