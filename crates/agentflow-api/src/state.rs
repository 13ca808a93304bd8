//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by both CLI and REST API.
//! The engine is generic over repository traits; AppState pins it to the
//! SQLite repositories and the in-process durable substrate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentflow_core::agent::BoxAgentInvoker;
use agentflow_core::event::EventBus;
use agentflow_core::repository::WorkflowRepository;
use agentflow_core::substrate::{DurableSubstrate, LocalSubstrate, RetryPolicy, SignalReceiver};
use agentflow_core::workflow::approval::ApprovalGate;
use agentflow_core::workflow::definition::{ValidationWarning, validate_definition};
use agentflow_core::workflow::executor::{
    WorkflowExecutor, WorkflowLauncher, spawn_recovery_worker, spawn_resume_worker,
};
use agentflow_core::workflow::schedule::ScheduleService;
use agentflow_infra::agent::http::HttpAgentInvoker;
use agentflow_infra::sqlite::approval::SqliteApprovalRepository;
use agentflow_infra::sqlite::pool::DatabasePool;
use agentflow_infra::sqlite::schedule::SqliteScheduleRepository;
use agentflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use agentflow_types::config::GlobalConfig;
use agentflow_types::workflow::{DefinitionMetadata, DefinitionStatus, StoredWorkflow, WorkflowDefinition};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::http::error::AppError;

/// Concrete type aliases for the engine generics pinned to infra implementations.
pub type ConcreteExecutor = WorkflowExecutor<SqliteWorkflowRepository, SqliteApprovalRepository>;

pub type ConcreteApprovalGate = ApprovalGate<SqliteApprovalRepository>;

pub type ConcreteScheduleService = ScheduleService<SqliteScheduleRepository>;

const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A stored definition plus the warnings found while validating it.
#[derive(Debug, Serialize)]
pub struct RegisteredWorkflow {
    #[serde(flatten)]
    pub stored: StoredWorkflow,
    pub warnings: Vec<ValidationWarning>,
}

/// Shared application state holding all services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<SqliteWorkflowRepository>,
    pub executor: Arc<ConcreteExecutor>,
    pub schedules: ConcreteScheduleService,
    pub events: EventBus,
    pub config: Arc<GlobalConfig>,
    pub data_dir: PathBuf,
    substrate: Arc<LocalSubstrate>,
    /// Taken by whoever drives resumption: the server's resume worker, or a
    /// CLI command that resumes in-process.
    signals: Arc<Mutex<Option<SignalReceiver>>>,
}

impl AppState {
    /// Initialize the application state: connect to DB, wire services, and
    /// send agent invocations to the configured HTTP endpoint.
    pub async fn init(data_dir: PathBuf, config: GlobalConfig) -> anyhow::Result<Self> {
        let invoker = HttpAgentInvoker::new(&config.agents.endpoint, AGENT_CONNECT_TIMEOUT)?
            .with_max_request_timeout(Duration::from_secs(config.agents.request_timeout_secs));
        Self::with_invoker(data_dir, config, BoxAgentInvoker::new(invoker)).await
    }

    /// Wire everything around the given agent invoker.
    pub async fn with_invoker(
        data_dir: PathBuf,
        config: GlobalConfig,
        invoker: BoxAgentInvoker,
    ) -> anyhow::Result<Self> {
        let db_pool = DatabasePool::open(&data_dir).await?;

        let (substrate, signals) = LocalSubstrate::new(RetryPolicy::from_config(&config.substrate));
        let substrate = Arc::new(substrate);
        let durable: Arc<dyn DurableSubstrate> = substrate.clone();
        let events = EventBus::default();

        let workflows = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));
        let gate = ApprovalGate::new(
            Arc::new(SqliteApprovalRepository::new(db_pool.clone())),
            Arc::clone(&durable),
            events.clone(),
        );
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&workflows),
            gate,
            invoker,
            Arc::clone(&durable),
            events.clone(),
            &config.executor,
        ));
        let launcher: Arc<dyn WorkflowLauncher> = executor.clone();
        let schedules = ScheduleService::new(
            Arc::new(SqliteScheduleRepository::new(db_pool)),
            durable,
            launcher,
        );

        Ok(Self {
            workflows,
            executor,
            schedules,
            events,
            config: Arc::new(config),
            data_dir,
            substrate,
            signals: Arc::new(Mutex::new(Some(signals))),
        })
    }

    pub fn gate(&self) -> &ConcreteApprovalGate {
        self.executor.gate()
    }

    /// Take the substrate's signal receiver. Only the first caller gets it.
    pub async fn take_signals(&self) -> Option<SignalReceiver> {
        self.signals.lock().await.take()
    }

    /// Validate and store a definition. Definitions with unbound agents are
    /// stored as drafts; invalid ones are never stored.
    pub async fn register_workflow(
        &self,
        def: &WorkflowDefinition,
        owner: Option<&str>,
    ) -> Result<RegisteredWorkflow, AppError> {
        let warnings = validate_definition(def)?;
        let status = if def.has_unbound_agents() {
            DefinitionStatus::Draft
        } else {
            DefinitionStatus::Active
        };
        let metadata = DefinitionMetadata {
            owner: owner.map(String::from),
            status,
        };
        let stored = self.workflows.save_definition(def, &metadata).await?;
        tracing::info!(
            workflow_id = def.id.as_str(),
            status = %status,
            warnings = warnings.len(),
            "workflow registered"
        );
        Ok(RegisteredWorkflow { stored, warnings })
    }

    /// Delete a definition and its schedules. Executions are kept as
    /// history. Returns `false` if the definition did not exist.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool, AppError> {
        for schedule in self.schedules.get_by_workflow(id).await? {
            self.schedules.delete(schedule.id).await?;
        }
        let deleted = self.workflows.delete_definition(id).await?;
        if deleted {
            tracing::info!(workflow_id = id, "workflow deleted");
        }
        Ok(deleted)
    }

    /// Start the long-running workers: event logging, signal-driven
    /// resumption, approval expiry and recovery, and schedule
    /// reconciliation. Also resumes runs whose approval resolved while no
    /// worker was listening, and re-registers stored schedules with the
    /// substrate.
    pub async fn start_background(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let recovered = self.executor.recover_resolved().await?;
        if !recovered.is_empty() {
            tracing::info!(recovered = recovered.len(), "resumed executions with resolved approvals");
        }

        let mut handles = vec![self.events.spawn_logger(cancel.clone())];
        match self.take_signals().await {
            Some(signals) => handles.push(spawn_resume_worker(
                Arc::clone(&self.executor),
                signals,
                cancel.clone(),
            )),
            None => tracing::warn!("signal receiver already taken, resume worker not started"),
        }

        let sweep_interval = Duration::from_secs(self.config.approvals.sweep_interval_secs);
        handles.push(self.gate().clone().spawn_expiry_sweeper(sweep_interval, cancel.clone()));
        handles.push(spawn_recovery_worker(
            Arc::clone(&self.executor),
            sweep_interval,
            cancel.clone(),
        ));

        let restored = self.schedules.restore(chrono::Utc::now()).await?;
        tracing::debug!(restored, "schedules re-registered");
        handles.push(self.schedules.clone().spawn_reconciler(
            Duration::from_secs(self.config.schedules.reconcile_interval_secs),
            cancel.clone(),
        ));

        Ok(handles)
    }

    /// Stop the substrate's schedule timers. Workers started by
    /// `start_background` stop through their cancellation token.
    pub fn shutdown(&self) {
        self.substrate.shutdown();
    }

    /// Resume every execution whose approval was resolved in this process,
    /// then every parked execution whose approval is already resolved.
    ///
    /// Used by one-shot CLI commands, where no resume worker is running.
    pub async fn drain_signals(&self) -> Vec<agentflow_types::execution::Execution> {
        let mut resumed = Vec::new();
        if let Some(signals) = self.signals.lock().await.as_mut() {
            while let Ok(envelope) = signals.try_recv() {
                match self.executor.resume(envelope.signal).await {
                    Ok(execution) => resumed.push(execution),
                    Err(e) => tracing::warn!(run_id = envelope.run_id.as_str(), error = %e, "failed to resume execution"),
                }
            }
        }
        match self.executor.recover_resolved().await {
            Ok(recovered) => resumed.extend(recovered),
            Err(e) => tracing::warn!(error = %e, "failed to recover parked executions"),
        }
        resumed
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use agentflow_core::agent::{AgentInvocation, AgentInvoker, AgentOutput, InvokeError};

    use super::*;

    /// Answers each agent id with a fixed output.
    #[derive(Default)]
    pub struct CannedInvoker {
        outputs: HashMap<String, AgentOutput>,
    }

    impl CannedInvoker {
        pub fn with(mut self, agent_id: &str, output: AgentOutput) -> Self {
            self.outputs.insert(agent_id.to_string(), output);
            self
        }
    }

    impl AgentInvoker for CannedInvoker {
        async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentOutput, InvokeError> {
            self.outputs
                .get(&invocation.agent_id)
                .cloned()
                .ok_or_else(|| InvokeError::UnknownAgent(invocation.agent_id.clone()))
        }
    }

    pub async fn test_state(dir: &tempfile::TempDir, invoker: CannedInvoker) -> AppState {
        test_state_with_config(dir, invoker, GlobalConfig::default()).await
    }

    pub async fn test_state_with_config(
        dir: &tempfile::TempDir,
        invoker: CannedInvoker,
        config: GlobalConfig,
    ) -> AppState {
        AppState::with_invoker(dir.path().to_path_buf(), config, BoxAgentInvoker::new(invoker))
            .await
            .unwrap()
    }

    pub fn definition(json: &str) -> WorkflowDefinition {
        serde_json::from_str(json).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use agentflow_core::agent::AgentOutput;
    use agentflow_types::execution::ExecutionStatus;

    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_register_marks_unbound_agents_as_draft() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, CannedInvoker::default()).await;

        let def = definition(
            r#"{"id": "triage", "steps": [{"id": "classify", "type": "agent", "suggested_agent": "a classifier"}]}"#,
        );
        let registered = state.register_workflow(&def, Some("alice")).await.unwrap();
        assert_eq!(registered.stored.metadata.status, DefinitionStatus::Draft);
        assert_eq!(registered.stored.metadata.owner.as_deref(), Some("alice"));
        assert!(!registered.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_cycle_without_storing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir, CannedInvoker::default()).await;

        let def = definition(
            r#"{"id": "loopy", "steps": [
                {"id": "a", "type": "agent", "agent_id": "x", "on_error": "b"},
                {"id": "b", "type": "agent", "agent_id": "x", "on_error": "a"}
            ]}"#,
        );
        let err = state.register_workflow(&def, None).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "got: {msg}");
        assert!(!state.workflows.exists("loopy").await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_signals_resumes_approved_execution() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = CannedInvoker::default().with("writer", AgentOutput::ok("draft text"));
        let state = test_state(&dir, invoker).await;

        let def = definition(
            r#"{"id": "review", "steps": [
                {"id": "gate", "type": "approval", "approval_message": "ok?", "approvers": ["bob"]},
                {"id": "write", "type": "agent", "agent_id": "writer"}
            ]}"#,
        );
        state.register_workflow(&def, None).await.unwrap();

        let parked = state
            .executor
            .execute("review", "go", Some("alice"), Default::default())
            .await
            .unwrap();
        assert_eq!(parked.status, ExecutionStatus::WaitingForApproval);
        let approval_id = parked.checkpoint.as_ref().unwrap().approval_id;

        let outcome = state
            .gate()
            .respond(
                approval_id,
                &agentflow_types::approval::Approver::new("bob"),
                agentflow_types::approval::ApprovalDecision::Approve,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.resumed);

        let resumed = state.drain_signals().await;
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, ExecutionStatus::Completed);
        assert_eq!(resumed[0].output.as_deref(), Some("draft text"));
    }

    #[tokio::test]
    async fn test_restart_resumes_approval_resolved_before_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let def = definition(
            r#"{"id": "review", "steps": [
                {"id": "gate", "type": "approval", "approval_message": "ok?", "approvers": ["bob"]},
                {"id": "write", "type": "agent", "agent_id": "writer"}
            ]}"#,
        );

        let parked = {
            let invoker = CannedInvoker::default().with("writer", AgentOutput::ok("draft text"));
            let state = test_state(&dir, invoker).await;
            state.register_workflow(&def, None).await.unwrap();
            let parked = state
                .executor
                .execute("review", "go", None, Default::default())
                .await
                .unwrap();
            let approval_id = parked.checkpoint.as_ref().unwrap().approval_id;
            state
                .gate()
                .respond(
                    approval_id,
                    &agentflow_types::approval::Approver::new("bob"),
                    agentflow_types::approval::ApprovalDecision::Approve,
                    None,
                )
                .await
                .unwrap();
            // Process exits with the signal still queued.
            parked
        };

        let invoker = CannedInvoker::default().with("writer", AgentOutput::ok("draft text"));
        let state = test_state(&dir, invoker).await;
        let cancel = CancellationToken::new();
        let workers = state.start_background(&cancel).await.unwrap();

        let execution = state.workflows.get_execution(&parked.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output.as_deref(), Some("draft text"));

        cancel.cancel();
        state.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_drain_signals_recovers_resolved_approval_from_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let def = definition(
            r#"{"id": "review", "steps": [
                {"id": "gate", "type": "approval", "approval_message": "ok?", "approvers": ["bob"]}
            ]}"#,
        );

        let parked = {
            let state = test_state(&dir, CannedInvoker::default()).await;
            state.register_workflow(&def, None).await.unwrap();
            let parked = state
                .executor
                .execute("review", "go", None, Default::default())
                .await
                .unwrap();
            state
                .gate()
                .respond(
                    parked.checkpoint.as_ref().unwrap().approval_id,
                    &agentflow_types::approval::Approver::new("bob"),
                    agentflow_types::approval::ApprovalDecision::Reject,
                    Some("not now".to_string()),
                )
                .await
                .unwrap();
            parked
        };

        let state = test_state(&dir, CannedInvoker::default()).await;
        let resumed = state.drain_signals().await;
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].id, parked.id);
        assert_eq!(resumed[0].status, ExecutionStatus::Failed);
        let msg = resumed[0].error.clone().unwrap();
        assert!(msg.contains("not now"), "got: {msg}");
    }
}
