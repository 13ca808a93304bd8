//! Workflow executor: the step-graph interpreter.
//!
//! `WorkflowExecutor` walks a validated definition one step at a time from
//! its entry step. Every visited step yields a `StepExecutionResult`; the
//! next step is the step's routing override, the next declared step, or
//! the `on_error` target after a failure. A visit budget of five times the
//! step count bounds runs whose jumps never terminate.
//!
//! # Suspension
//!
//! An approval step opens a request through the `ApprovalGate` and parks
//! the execution with a checkpoint (namespace, waiting step, visit count).
//! The gate later signals the durable run, the resume worker hands the
//! signal to `resume`, and interpretation continues from the checkpoint.
//! Nothing about a parked run lives only in memory.

use std::sync::Arc;
use std::time::Duration;

use agentflow_types::config::ExecutorConfig;
use agentflow_types::event::WorkflowEvent;
use agentflow_types::execution::{Execution, ExecutionStatus, StepExecutionResult, StepStatus};
use agentflow_types::workflow::{ApprovalStep, OnError, StepKind, WorkflowDefinition, WorkflowStep};
use chrono::Utc;
use dashmap::DashSet;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::BoxAgentInvoker;
use crate::event::EventBus;
use crate::repository::{ApprovalRepository, WorkflowRepository};
use crate::substrate::{ApprovalOutcome, BoxFuture, DurableSubstrate, SignalReceiver, WorkflowSignal};

use super::approval::{ApprovalError, ApprovalGate, NewApproval, resolution_signal};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::definition::validate_definition;
use super::namespace::Namespace;
use super::step_runner::{RunContext, StepError, StepRunner};

/// Visits allowed per declared step.
const VISITS_PER_STEP: u32 = 5;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that prevent the executor from producing an execution record.
///
/// Step failures are never reported here; they end up in the execution's
/// `status` and `error`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{id}' is invalid: {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is not waiting on that approval")]
    NotWaiting(Uuid),
}

/// Where interpretation goes after a step settles.
enum Flow {
    Next(Option<String>),
    Stop(String),
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor<W: WorkflowRepository, A: ApprovalRepository> {
    checkpoint: CheckpointManager<W>,
    gate: ApprovalGate<A>,
    runner: StepRunner,
    events: EventBus,
    /// Executions with a `resume` in flight in this process.
    resuming: DashSet<Uuid>,
}

impl<W: WorkflowRepository, A: ApprovalRepository> WorkflowExecutor<W, A> {
    pub fn new(
        workflows: Arc<W>,
        gate: ApprovalGate<A>,
        invoker: BoxAgentInvoker,
        substrate: Arc<dyn DurableSubstrate>,
        events: EventBus,
        config: &ExecutorConfig,
    ) -> Self {
        let runner = StepRunner::new(
            invoker,
            substrate,
            Duration::from_secs(config.default_step_timeout_secs),
            config.max_output_bytes,
        );
        Self {
            checkpoint: CheckpointManager::new(workflows),
            gate,
            runner,
            events,
            resuming: DashSet::new(),
        }
    }

    pub fn gate(&self) -> &ApprovalGate<A> {
        &self.gate
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run a stored workflow until it completes, fails, or parks on an
    /// approval step.
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: &str,
        user_id: Option<&str>,
        context: Map<String, Value>,
    ) -> Result<Execution, ExecutorError> {
        let def = self.load_definition(workflow_id).await?;
        validate_definition(&def).map_err(|e| ExecutorError::InvalidDefinition {
            id: def.id.clone(),
            reason: e.to_string(),
        })?;

        let mut initial = def.context.clone();
        initial.extend(context);
        let ns = Namespace::new(input, initial);

        let run_id = format!("{}/{}", def.id, Uuid::now_v7());
        let execution = Execution::start(&def.id, run_id, input, user_id);
        self.checkpoint.create(&execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = def.id.as_str(),
            steps = def.steps.len(),
            "execution started"
        );
        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution.id,
            workflow_id: def.id.clone(),
        });

        let entry = def.entry_step_id().map(String::from);
        self.drive(&def, execution, ns, entry, 0).await
    }

    /// Continue a parked execution with an approval decision.
    ///
    /// Delivering the same signal twice is harmless: the second delivery
    /// fails with `NotWaiting`.
    pub async fn resume(&self, signal: WorkflowSignal) -> Result<Execution, ExecutorError> {
        let WorkflowSignal::ApprovalResolved { execution_id, .. } = &signal;
        let execution_id = *execution_id;
        if !self.resuming.insert(execution_id) {
            return Err(ExecutorError::NotWaiting(execution_id));
        }
        let _claim = ResumeClaim {
            resuming: &self.resuming,
            execution_id,
        };
        self.resume_claimed(signal).await
    }

    /// Resume every parked execution whose approval request is already
    /// resolved. Covers signals lost to a restart or a failed delivery.
    pub async fn recover_resolved(&self) -> Result<Vec<Execution>, ExecutorError> {
        let waiting = self
            .checkpoint
            .repo()
            .list_waiting_executions()
            .await
            .map_err(|e| ExecutorError::Repository(e.to_string()))?;

        let mut resumed = Vec::new();
        for execution in waiting {
            let Some(checkpoint) = &execution.checkpoint else {
                continue;
            };
            let request = match self.gate.get(checkpoint.approval_id).await {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        approval_id = %checkpoint.approval_id,
                        error = %e,
                        "parked execution has no readable approval request"
                    );
                    continue;
                }
            };
            let Some(signal) = resolution_signal(&request) else {
                continue;
            };
            tracing::info!(
                execution_id = %execution.id,
                approval_id = %request.id,
                status = %request.status,
                "re-delivering approval resolution"
            );
            match self.resume(signal).await {
                Ok(execution) => resumed.push(execution),
                Err(ExecutorError::NotWaiting(_)) => {}
                Err(e) => tracing::warn!(execution_id = %execution.id, error = %e, "recovery resume failed"),
            }
        }
        Ok(resumed)
    }

    async fn resume_claimed(&self, signal: WorkflowSignal) -> Result<Execution, ExecutorError> {
        let WorkflowSignal::ApprovalResolved {
            execution_id,
            step_id,
            approval_id,
            outcome,
        } = signal;

        let mut execution = self
            .checkpoint
            .load(execution_id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))?;
        let checkpoint = match &execution.checkpoint {
            Some(cp)
                if execution.status == ExecutionStatus::WaitingForApproval
                    && cp.step_id == step_id
                    && cp.approval_id == approval_id =>
            {
                cp.clone()
            }
            _ => return Err(ExecutorError::NotWaiting(execution_id)),
        };
        let ns = CheckpointManager::<W>::restore_namespace(&checkpoint)?;

        execution.status = ExecutionStatus::Running;
        execution.checkpoint = None;
        tracing::info!(
            execution_id = %execution.id,
            step_id = step_id.as_str(),
            outcome = ?outcome,
            "execution resumed"
        );
        self.events.publish(WorkflowEvent::ExecutionResumed {
            execution_id: execution.id,
            step_id: step_id.clone(),
        });

        let def = match self.load_definition(&execution.workflow_id).await {
            Ok(def) => def,
            Err(ExecutorError::WorkflowNotFound(id)) => {
                return self
                    .fail(execution, format!("workflow definition '{id}' no longer exists"))
                    .await;
            }
            Err(e) => return Err(e),
        };
        let Some(step) = def.step(&step_id) else {
            return self
                .fail(execution, format!("approval step '{step_id}' no longer exists"))
                .await;
        };

        let flow = match outcome {
            ApprovalOutcome::Approved => {
                self.settle_waiting(&mut execution, &step_id, StepStatus::Completed, None);
                self.events.publish(WorkflowEvent::StepCompleted {
                    execution_id: execution.id,
                    step_id: step_id.clone(),
                    duration_ms: execution
                        .step_results
                        .get(&step_id)
                        .map(|r| r.duration_ms)
                        .unwrap_or_default(),
                });
                Flow::Next(next_sequential(&def, &step_id))
            }
            ApprovalOutcome::Rejected { reason } => {
                let policy = match &step.kind {
                    StepKind::Approval(approval) => approval.on_reject.clone().unwrap_or_default(),
                    _ => OnError::Fail,
                };
                let error = StepError::ApprovalRejected(reason).to_string();
                self.settle_waiting(&mut execution, &step_id, StepStatus::Failed, Some(error.clone()));
                self.publish_step_failed(&execution, &step_id, &error);
                route_failure(&def, step, &policy, &error)
            }
            ApprovalOutcome::Expired => {
                let error = StepError::ApprovalTimeout(step_id.clone()).to_string();
                self.settle_waiting(&mut execution, &step_id, StepStatus::Failed, Some(error.clone()));
                self.publish_step_failed(&execution, &step_id, &error);
                route_failure(&def, step, &step.on_error, &error)
            }
        };
        self.checkpoint.save(&execution).await?;

        match flow {
            Flow::Next(next) => self.drive(&def, execution, ns, next, checkpoint.visits).await,
            Flow::Stop(error) => self.fail(execution, error).await,
        }
    }

    // -----------------------------------------------------------------------
    // Interpreter loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        def: &WorkflowDefinition,
        mut execution: Execution,
        mut ns: Namespace,
        mut current: Option<String>,
        mut visits: u32,
    ) -> Result<Execution, ExecutorError> {
        let budget = def.steps.len() as u32 * VISITS_PER_STEP;
        let run = RunContext {
            execution_id: execution.id,
            run_id: execution.run_id.clone(),
            user_id: execution.user_id.clone(),
        };

        while let Some(step_id) = current.take() {
            if visits >= budget {
                return self
                    .fail(
                        execution,
                        format!("step visit budget of {budget} exhausted at step '{step_id}'"),
                    )
                    .await;
            }
            visits += 1;

            let Some(step) = def.step(&step_id) else {
                return self
                    .fail(execution, format!("step '{step_id}' does not exist"))
                    .await;
            };

            tracing::debug!(
                execution_id = %execution.id,
                step_id = step.id.as_str(),
                step_type = step.kind_name(),
                visit = visits,
                "step started"
            );
            self.events.publish(WorkflowEvent::StepStarted {
                execution_id: execution.id,
                step_id: step.id.clone(),
                step_type: step.kind_name().to_string(),
            });
            let started_at = Utc::now();

            let outcome = match &step.kind {
                StepKind::Approval(approval) => {
                    match self.open_approval(def, step, approval, &execution, &ns).await {
                        Ok(approval_id) => {
                            execution.record_step(StepExecutionResult::waiting(&step.id, started_at));
                            self.checkpoint
                                .suspend(&mut execution, &step.id, approval_id, visits, &ns)
                                .await?;
                            tracing::info!(
                                execution_id = %execution.id,
                                step_id = step.id.as_str(),
                                approval_id = %approval_id,
                                "execution suspended for approval"
                            );
                            self.events.publish(WorkflowEvent::ExecutionSuspended {
                                execution_id: execution.id,
                                step_id: step.id.clone(),
                                approval_id,
                            });
                            return Ok(execution);
                        }
                        Err(error) => Err(error.into()),
                    }
                }
                _ => self.runner.run(step, &mut ns, &run).await,
            };

            let flow = match outcome {
                Ok(done) => {
                    ns.record_output(&step.id, &done.output);
                    if !done.output.is_empty() {
                        execution.output = Some(done.output.clone());
                    }
                    let mut result = StepExecutionResult::completed(&step.id, done.output, started_at);
                    result.branches = done.branches;
                    result.iterations = done.iterations;
                    tracing::debug!(
                        execution_id = %execution.id,
                        step_id = step.id.as_str(),
                        duration_ms = result.duration_ms,
                        "step completed"
                    );
                    self.events.publish(WorkflowEvent::StepCompleted {
                        execution_id: execution.id,
                        step_id: step.id.clone(),
                        duration_ms: result.duration_ms,
                    });
                    execution.record_step(result);
                    Flow::Next(done.next.or_else(|| next_sequential(def, &step.id)))
                }
                Err(failure) => {
                    let error = failure.error.to_string();
                    let mut result = StepExecutionResult::failed(&step.id, error.clone(), started_at);
                    result.output = failure.output;
                    result.branches = failure.branches;
                    result.iterations = failure.iterations;
                    tracing::warn!(
                        execution_id = %execution.id,
                        step_id = step.id.as_str(),
                        on_error = %step.on_error,
                        error = error.as_str(),
                        "step failed"
                    );
                    execution.record_step(result);
                    self.publish_step_failed(&execution, &step.id, &error);
                    route_failure(def, step, &step.on_error, &error)
                }
            };
            self.checkpoint.save(&execution).await?;

            match flow {
                Flow::Next(next) => current = next,
                Flow::Stop(error) => return self.fail(execution, error).await,
            }
        }

        self.complete(execution).await
    }

    async fn open_approval(
        &self,
        def: &WorkflowDefinition,
        step: &WorkflowStep,
        approval: &ApprovalStep,
        execution: &Execution,
        ns: &Namespace,
    ) -> Result<Uuid, StepError> {
        let title = approval
            .title
            .clone()
            .or_else(|| step.name.clone())
            .unwrap_or_else(|| format!("Approval required: {}", step.id));
        let new = NewApproval {
            workflow_id: def.id.clone(),
            execution_id: execution.id,
            step_id: step.id.clone(),
            run_id: execution.run_id.clone(),
            title,
            message: ns.resolve(&approval.approval_message),
            context: ns.outputs_snapshot(),
            approvers: approval.approvers.clone(),
            required_approvals: approval.required_approvals,
            timeout_secs: approval.approval_timeout,
            created_by: execution.user_id.clone(),
        };
        match self.gate.open(new).await {
            Ok(request) => Ok(request.id),
            Err(e @ ApprovalError::NoApprovers(_)) => Err(StepError::Configuration(e.to_string())),
            Err(e) => Err(StepError::Execution(format!("failed to open approval request: {e}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn complete(&self, mut execution: Execution) -> Result<Execution, ExecutorError> {
        execution.finish(ExecutionStatus::Completed, None);
        self.checkpoint.save(&execution).await?;
        let duration_ms = execution.duration_ms.unwrap_or_default();
        tracing::info!(
            execution_id = %execution.id,
            workflow_id = execution.workflow_id.as_str(),
            duration_ms,
            steps = execution.steps_executed.len(),
            "execution completed"
        );
        self.events.publish(WorkflowEvent::ExecutionCompleted {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            duration_ms,
            steps_executed: execution.steps_executed.len(),
        });
        Ok(execution)
    }

    async fn fail(&self, mut execution: Execution, error: String) -> Result<Execution, ExecutorError> {
        execution.finish(ExecutionStatus::Failed, Some(error.clone()));
        self.checkpoint.save(&execution).await?;
        tracing::info!(
            execution_id = %execution.id,
            workflow_id = execution.workflow_id.as_str(),
            error = error.as_str(),
            "execution failed"
        );
        self.events.publish(WorkflowEvent::ExecutionFailed {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            error,
        });
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, ExecutorError> {
        self.checkpoint
            .repo()
            .get_definition(workflow_id)
            .await
            .map_err(|e| ExecutorError::Repository(e.to_string()))?
            .map(|stored| stored.definition)
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn settle_waiting(&self, execution: &mut Execution, step_id: &str, status: StepStatus, error: Option<String>) {
        match execution.step_results.get_mut(step_id) {
            Some(result) => result.settle(status, error),
            None => {
                let mut result = StepExecutionResult::waiting(step_id, Utc::now());
                result.settle(status, error);
                execution.record_step(result);
            }
        }
    }

    fn publish_step_failed(&self, execution: &Execution, step_id: &str, error: &str) {
        self.events.publish(WorkflowEvent::StepFailed {
            execution_id: execution.id,
            step_id: step_id.to_string(),
            error: error.to_string(),
        });
    }
}

fn next_sequential(def: &WorkflowDefinition, step_id: &str) -> Option<String> {
    def.step_index(step_id)
        .and_then(|i| def.steps.get(i + 1))
        .map(|s| s.id.clone())
}

fn route_failure(def: &WorkflowDefinition, step: &WorkflowStep, policy: &OnError, error: &str) -> Flow {
    match policy {
        OnError::Fail => Flow::Stop(format!("step '{}' failed: {error}", step.id)),
        OnError::Skip => Flow::Next(next_sequential(def, &step.id)),
        OnError::Goto(target) => Flow::Next(Some(target.clone())),
    }
}

/// Releases an execution's in-flight resume slot on drop.
struct ResumeClaim<'a> {
    resuming: &'a DashSet<Uuid>,
    execution_id: Uuid,
}

impl Drop for ResumeClaim<'_> {
    fn drop(&mut self) {
        self.resuming.remove(&self.execution_id);
    }
}

// ---------------------------------------------------------------------------
// Resume worker
// ---------------------------------------------------------------------------

/// Drain substrate signals and resume each addressed execution on its own
/// task until cancelled.
pub fn spawn_resume_worker<W, A>(
    executor: Arc<WorkflowExecutor<W, A>>,
    mut signals: SignalReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = signals.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let run_id = envelope.run_id;
                match executor.resume(envelope.signal).await {
                    Ok(execution) => tracing::debug!(
                        run_id = run_id.as_str(),
                        execution_id = %execution.id,
                        status = %execution.status,
                        "signal handled"
                    ),
                    Err(e) => tracing::warn!(run_id = run_id.as_str(), error = %e, "failed to resume execution"),
                }
            });
        }
        tracing::debug!("resume worker stopped");
    })
}

/// Run `recover_resolved` every `interval` until cancelled. The first pass
/// runs immediately.
pub fn spawn_recovery_worker<W, A>(
    executor: Arc<WorkflowExecutor<W, A>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match executor.recover_resolved().await {
                    Ok(resumed) if !resumed.is_empty() => {
                        tracing::info!(resumed = resumed.len(), "recovered parked executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "approval recovery pass failed"),
                },
            }
        }
        tracing::debug!("recovery worker stopped");
    })
}

// ---------------------------------------------------------------------------
// WorkflowLauncher
// ---------------------------------------------------------------------------

/// Object-safe entry point used by schedule callbacks.
pub trait WorkflowLauncher: Send + Sync {
    fn launch<'a>(
        &'a self,
        workflow_id: &'a str,
        input: &'a str,
        user_id: Option<&'a str>,
        context: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Execution, String>>;
}

impl<W: WorkflowRepository, A: ApprovalRepository> WorkflowLauncher for WorkflowExecutor<W, A> {
    fn launch<'a>(
        &'a self,
        workflow_id: &'a str,
        input: &'a str,
        user_id: Option<&'a str>,
        context: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Execution, String>> {
        Box::pin(async move {
            self.execute(workflow_id, input, user_id, context)
                .await
                .map_err(|e| e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use agentflow_types::approval::{ApprovalDecision, Approver};
    use agentflow_types::workflow::{DefinitionMetadata, DefinitionStatus};
    use serde_json::json;

    use super::*;
    use crate::agent::AgentOutput;
    use crate::substrate::LocalSubstrate;
    use crate::test_support::{
        MemoryApprovalRepository, MemoryWorkflowRepository, ScriptedInvoker, definition, fast_retry,
    };

    type TestExecutor = WorkflowExecutor<MemoryWorkflowRepository, MemoryApprovalRepository>;

    struct Harness {
        executor: TestExecutor,
        workflows: Arc<MemoryWorkflowRepository>,
        signals: SignalReceiver,
        events: EventBus,
    }

    async fn harness(def_json: &str, invoker: ScriptedInvoker) -> Harness {
        let (substrate, signals) = LocalSubstrate::new(fast_retry());
        let substrate: Arc<dyn DurableSubstrate> = Arc::new(substrate);
        let events = EventBus::new(256);
        let workflows = Arc::new(MemoryWorkflowRepository::default());
        let gate = ApprovalGate::new(
            Arc::new(MemoryApprovalRepository::default()),
            Arc::clone(&substrate),
            events.clone(),
        );
        let executor = WorkflowExecutor::new(
            Arc::clone(&workflows),
            gate,
            BoxAgentInvoker::new(invoker),
            substrate,
            events.clone(),
            &ExecutorConfig::default(),
        );

        let def = definition(def_json);
        let metadata = DefinitionMetadata {
            owner: Some("alice".to_string()),
            status: DefinitionStatus::Active,
        };
        workflows.save_definition(&def, &metadata).await.unwrap();
        Harness {
            executor,
            workflows,
            signals,
            events,
        }
    }

    impl Harness {
        async fn run(&self, input: &str) -> Execution {
            self.executor
                .execute("wf", input, Some("alice"), Map::new())
                .await
                .unwrap()
        }

        /// Deliver the next queued substrate signal to the executor.
        async fn deliver_signal(&mut self) -> Execution {
            let envelope = self.signals.recv().await.unwrap();
            self.executor.resume(envelope.signal).await.unwrap()
        }
    }

    #[tokio::test]
    async fn single_agent_step_completes_with_its_output() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"s1","type":"agent","agent_id":"a1","input":"${user_input}"}],"entry_step":"s1"}"#,
            ScriptedInvoker::new().reply("a1", "ok"),
        )
        .await;

        let execution = h.run("hello").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output.as_deref(), Some("ok"));
        assert_eq!(execution.steps_executed, vec!["s1"]);
        assert!(execution.error.is_none());

        let stored = h.workflows.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn outputs_flow_between_steps() {
        let h = harness(
            r#"{"id":"wf","context":{"tone":"dry"},"steps":[
                {"id":"research","type":"agent","agent_id":"r"},
                {"id":"write","type":"agent","agent_id":"w","input":"${steps.research.output} in ${context.tone} tone"},
                {"id":"blank","type":"agent","agent_id":"quiet"}
            ]}"#,
            ScriptedInvoker::new().echo("r").echo("w").reply("quiet", ""),
        )
        .await;

        let execution = h.run("cats").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.step_results["write"].output.as_deref(),
            Some("w(r(cats) in dry tone)")
        );
        // An empty output does not replace the final output.
        assert_eq!(execution.output.as_deref(), Some("w(r(cats) in dry tone)"));
    }

    #[tokio::test]
    async fn request_context_overrides_definition_context() {
        let h = harness(
            r#"{"id":"wf","context":{"tone":"dry"},"steps":[{"id":"s","type":"agent","agent_id":"w","input":"${context.tone}"}]}"#,
            ScriptedInvoker::new().echo("w"),
        )
        .await;
        let mut context = Map::new();
        context.insert("tone".to_string(), json!("warm"));
        let execution = h.executor.execute("wf", "", None, context).await.unwrap();
        assert_eq!(execution.output.as_deref(), Some("w(warm)"));
    }

    const ROUTING: &str = r#"{"id":"wf","steps":[
        {"id":"first","type":"agent","agent_id":"broken","on_error":"POLICY"},
        {"id":"second","type":"agent","agent_id":"ok"},
        {"id":"cleanup","type":"agent","agent_id":"janitor"}
    ]}"#;

    #[tokio::test]
    async fn on_error_skip_continues_sequentially() {
        let h = harness(
            &ROUTING.replace("POLICY", "skip"),
            ScriptedInvoker::new().fail("broken", "bad input").reply("ok", "fine").reply("janitor", "swept"),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps_executed, vec!["first", "second", "cleanup"]);
        assert_eq!(execution.step_results["first"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn on_error_goto_routes_to_target() {
        let h = harness(
            &ROUTING.replace("POLICY", "cleanup"),
            ScriptedInvoker::new().fail("broken", "bad input").reply("ok", "fine").reply("janitor", "swept"),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps_executed, vec!["first", "cleanup"]);
        assert_eq!(execution.output.as_deref(), Some("swept"));
    }

    #[tokio::test]
    async fn on_error_fail_terminates_with_step_error() {
        let h = harness(
            &ROUTING.replace("POLICY", "fail"),
            ScriptedInvoker::new().fail("broken", "bad input").reply("ok", "fine"),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.steps_executed, vec!["first"]);
        let msg = execution.error.unwrap();
        assert!(msg.contains("first") && msg.contains("bad input"), "got: {msg}");
        assert!(execution.completed_at.is_some());
    }

    #[tokio::test]
    async fn unbound_agent_fails_instead_of_skipping() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"draft","type":"agent","suggested_agent":"a summarizer"}]}"#,
            ScriptedInvoker::new(),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let msg = execution.error.unwrap();
        assert!(msg.contains("configuration error"), "got: {msg}");
    }

    #[tokio::test]
    async fn conditional_routes_to_matching_branch() {
        let h = harness(
            r#"{"id":"wf","steps":[
                {"id":"classify","type":"agent","agent_id":"c"},
                {"id":"route","type":"conditional","condition_source":"${previous}",
                 "branches":{"refund":"refund"},"default":"general"},
                {"id":"general","type":"agent","agent_id":"g","on_error":"skip"},
                {"id":"refund","type":"agent","agent_id":"r","input":"handle: ${previous}"}
            ]}"#,
            ScriptedInvoker::new().reply("c", "Customer wants a REFUND").echo("r").reply("g", "general"),
        )
        .await;
        let execution = h.run("please").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps_executed, vec!["classify", "route", "refund"]);
        assert_eq!(execution.output.as_deref(), Some("r(handle: Customer wants a REFUND)"));
    }

    #[tokio::test]
    async fn parallel_step_records_branch_results() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"fan","type":"parallel","aggregation":"first","branches":[
                {"agent_id":"broken"},{"agent_id":"b"},{"agent_id":"c"}]}]}"#,
            ScriptedInvoker::new().fail("broken", "down").reply("b", "from b").reply("c", "from c"),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output.as_deref(), Some("from b"));
        let branches = &execution.step_results["fan"].branches;
        assert_eq!(branches.len(), 3);
        assert!(!branches[0].success);
    }

    #[tokio::test]
    async fn loop_iterations_are_recorded() {
        let invoker = ScriptedInvoker::new().echo("w");
        let h = harness(
            r#"{"id":"wf","steps":[
                {"id":"each","type":"loop","loop_mode":"foreach","over":"${user_input}","collect_results":true,
                 "steps":[{"id":"one","agent_id":"w","input":"${loop.item}"}]},
                {"id":"after","type":"agent","agent_id":"w","input":"${loop.item}|${previous}"}
            ]}"#,
            invoker.clone(),
        )
        .await;
        let execution = h.run("a,b,c").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results["each"].iterations, Some(3));
        // Loop variables do not leak past the loop.
        let last = invoker.calls().pop().unwrap();
        assert_eq!(last.input, r#"${loop.item}|["w(a)","w(b)","w(c)"]"#);
    }

    #[tokio::test]
    async fn visit_budget_stops_endless_jumps() {
        let h = harness(
            r#"{"id":"wf","steps":[
                {"id":"a","type":"agent","agent_id":"broken","on_error":"b"},
                {"id":"b","type":"agent","agent_id":"ok"}
            ]}"#,
            ScriptedInvoker::new().fail("broken", "nope").reply("ok", "fine"),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Completed);

        // Validated graphs are acyclic, so start a run with its budget spent.
        let parked = Execution::start("wf", "wf/r".to_string(), "x", None);
        h.workflows.create_execution(&parked).await.unwrap();
        let def = h.executor.load_definition("wf").await.unwrap();
        let execution = h
            .executor
            .drive(&def, parked, Namespace::new("x", Map::new()), Some("a".to_string()), 10)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let msg = execution.error.unwrap();
        assert!(msg.contains("visit budget of 10"), "got: {msg}");
    }

    #[tokio::test]
    async fn missing_workflow_is_an_error() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"s","type":"agent","agent_id":"a"}]}"#,
            ScriptedInvoker::new(),
        )
        .await;
        let err = h.executor.execute("nope", "", None, Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn events_follow_execution_lifecycle() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"s","type":"agent","agent_id":"a"}]}"#,
            ScriptedInvoker::new().reply("a", "done"),
        )
        .await;
        let mut rx = h.events.subscribe();
        h.run("x").await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::ExecutionStarted { .. } => "started",
                WorkflowEvent::StepStarted { .. } => "step_started",
                WorkflowEvent::StepCompleted { .. } => "step_completed",
                WorkflowEvent::ExecutionCompleted { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "step_started", "step_completed", "completed"]);
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    const GATED: &str = r#"{"id":"wf","steps":[
        {"id":"draft","type":"agent","agent_id":"writer"},
        {"id":"review","type":"approval","approval_message":"Publish ${previous}?",
         "approvers":["bob"],"approval_timeout":3600 ON_REJECT},
        {"id":"publish","type":"agent","agent_id":"publisher"},
        {"id":"revise","type":"agent","agent_id":"writer","input":"revise"}
    ]}"#;

    fn gated(on_reject: &str) -> String {
        GATED.replace("ON_REJECT", on_reject)
    }

    fn gated_invoker() -> ScriptedInvoker {
        ScriptedInvoker::new().echo("writer").echo("publisher")
    }

    #[tokio::test]
    async fn approval_suspends_and_approve_resumes() {
        let mut h = harness(&gated(""), gated_invoker()).await;

        let parked = h.run("post").await;
        assert_eq!(parked.status, ExecutionStatus::WaitingForApproval);
        assert_eq!(parked.steps_executed, vec!["draft", "review"]);
        let checkpoint = parked.checkpoint.clone().unwrap();
        assert_eq!(checkpoint.step_id, "review");

        let request = h.executor.gate().get(checkpoint.approval_id).await.unwrap();
        assert_eq!(request.message, "Publish writer(post)?");
        assert_eq!(request.run_id, parked.run_id);

        let outcome = h
            .executor
            .gate()
            .respond(checkpoint.approval_id, &Approver::new("bob"), ApprovalDecision::Approve, None)
            .await
            .unwrap();
        assert!(outcome.resumed);

        let execution = h.deliver_signal().await;
        assert_eq!(execution.id, parked.id);
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps_executed, vec!["draft", "review", "publish", "revise"]);
        assert_eq!(execution.step_results["review"].status, StepStatus::Completed);
        // The gate produces no output, so publish reads the draft.
        assert_eq!(
            execution.step_results["publish"].output.as_deref(),
            Some("publisher(writer(post))")
        );
        assert!(execution.checkpoint.is_none());
    }

    #[tokio::test]
    async fn rejection_applies_on_reject_policy() {
        let mut h = harness(&gated(r#","on_reject":"revise""#), gated_invoker()).await;
        let parked = h.run("post").await;
        let approval_id = parked.checkpoint.unwrap().approval_id;

        h.executor
            .gate()
            .respond(approval_id, &Approver::new("bob"), ApprovalDecision::Reject, Some("too long".to_string()))
            .await
            .unwrap();
        let execution = h.deliver_signal().await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps_executed, vec!["draft", "review", "revise"]);
        let msg = execution.step_results["review"].error.clone().unwrap();
        assert!(msg.contains("too long"), "got: {msg}");
    }

    #[tokio::test]
    async fn rejection_defaults_to_fail() {
        let mut h = harness(&gated(""), gated_invoker()).await;
        let parked = h.run("post").await;
        let approval_id = parked.checkpoint.unwrap().approval_id;

        h.executor
            .gate()
            .respond(approval_id, &Approver::new("bob"), ApprovalDecision::Reject, None)
            .await
            .unwrap();
        let execution = h.deliver_signal().await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let msg = execution.error.unwrap();
        assert!(msg.contains("approval rejected"), "got: {msg}");
    }

    #[tokio::test]
    async fn expiry_fails_the_gate_through_on_error() {
        let mut h = harness(&gated(""), gated_invoker()).await;
        let parked = h.run("post").await;

        let expired = h
            .executor
            .gate()
            .expire_overdue(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        let execution = h.deliver_signal().await;
        assert_eq!(execution.id, parked.id);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let msg = execution.error.unwrap();
        assert!(msg.contains("timed out"), "got: {msg}");
    }

    #[tokio::test]
    async fn gate_without_approvers_is_a_configuration_failure() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"gate","type":"approval","approval_message":"ok?","approvers":[" "]}]}"#,
            ScriptedInvoker::new(),
        )
        .await;
        let execution = h.run("x").await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let msg = execution.error.unwrap();
        assert!(msg.contains("no approvers"), "got: {msg}");
    }

    #[tokio::test]
    async fn resume_rejects_stale_signals() {
        let h = harness(&gated(""), gated_invoker()).await;
        let parked = h.run("post").await;

        let stale = WorkflowSignal::ApprovalResolved {
            execution_id: parked.id,
            step_id: "review".to_string(),
            approval_id: Uuid::now_v7(),
            outcome: ApprovalOutcome::Approved,
        };
        let err = h.executor.resume(stale).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotWaiting(_)));

        let unknown = WorkflowSignal::ApprovalResolved {
            execution_id: Uuid::now_v7(),
            step_id: "review".to_string(),
            approval_id: Uuid::now_v7(),
            outcome: ApprovalOutcome::Approved,
        };
        let err = h.executor.resume(unknown).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn resume_worker_drives_parked_runs() {
        let h = harness(&gated(""), gated_invoker()).await;
        let Harness {
            executor,
            workflows,
            signals,
            ..
        } = h;
        let executor = Arc::new(executor);
        let cancel = CancellationToken::new();
        let worker = spawn_resume_worker(Arc::clone(&executor), signals, cancel.clone());

        let parked = executor.execute("wf", "post", None, Map::new()).await.unwrap();
        let approval_id = parked.checkpoint.unwrap().approval_id;
        executor
            .gate()
            .respond(approval_id, &Approver::new("bob"), ApprovalDecision::Approve, None)
            .await
            .unwrap();

        let mut status = ExecutionStatus::WaitingForApproval;
        for _ in 0..100 {
            status = workflows.get_execution(&parked.id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ExecutionStatus::Completed);

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn recovery_resumes_runs_whose_signal_was_dropped() {
        let Harness { executor, signals, .. } = harness(&gated(""), gated_invoker()).await;
        let parked = executor.execute("wf", "post", None, Map::new()).await.unwrap();
        let approval_id = parked.checkpoint.unwrap().approval_id;
        executor
            .gate()
            .respond(approval_id, &Approver::new("bob"), ApprovalDecision::Approve, None)
            .await
            .unwrap();
        // The queued signal never reaches a worker.
        drop(signals);

        let resumed = executor.recover_resolved().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].id, parked.id);
        assert_eq!(resumed[0].status, ExecutionStatus::Completed);

        assert!(executor.recover_resolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_leaves_pending_approvals_parked() {
        let h = harness(&gated(""), gated_invoker()).await;
        let parked = h.run("post").await;

        assert!(h.executor.recover_resolved().await.unwrap().is_empty());
        let stored = h.workflows.get_execution(&parked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::WaitingForApproval);
    }

    #[tokio::test]
    async fn duplicate_delivery_resumes_once() {
        let mut h = harness(&gated(""), gated_invoker()).await;
        let parked = h.run("post").await;
        let approval_id = parked.checkpoint.unwrap().approval_id;
        h.executor
            .gate()
            .respond(approval_id, &Approver::new("bob"), ApprovalDecision::Approve, None)
            .await
            .unwrap();
        let envelope = h.signals.recv().await.unwrap();

        let (first, second) = tokio::join!(
            h.executor.resume(envelope.signal.clone()),
            h.executor.recover_resolved()
        );
        let resumed_by_recovery = second.unwrap().len();
        let resumed_by_signal = usize::from(first.is_ok());
        assert_eq!(resumed_by_signal + resumed_by_recovery, 1);

        let stored = h.workflows.get_execution(&parked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.steps_executed, vec!["draft", "review", "publish", "revise"]);
    }

    #[tokio::test]
    async fn launcher_reports_errors_as_text() {
        let h = harness(
            r#"{"id":"wf","steps":[{"id":"s","type":"agent","agent_id":"a"}]}"#,
            ScriptedInvoker::new().with("a", |_| Ok(AgentOutput::ok("hi"))),
        )
        .await;
        let launcher: &dyn WorkflowLauncher = &h.executor;
        let execution = launcher.launch("wf", "", None, Map::new()).await.unwrap();
        assert_eq!(execution.output.as_deref(), Some("hi"));

        let err = launcher.launch("missing", "", None, Map::new()).await.unwrap_err();
        assert!(err.contains("not found"), "got: {err}");
    }
}
