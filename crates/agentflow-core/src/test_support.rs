//! In-memory repositories and scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentflow_types::approval::{ApprovalRequest, ApprovalResponse, ApprovalStatus, Approver};
use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{Execution, ExecutionStatus};
use agentflow_types::schedule::{ScheduleRecord, ScheduleRun, SyncState};
use agentflow_types::workflow::{DefinitionMetadata, StoredWorkflow, WorkflowDefinition};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{AgentInvocation, AgentInvoker, AgentOutput, InvokeError};
use crate::repository::{ApprovalRepository, RespondError, ScheduleRepository, WorkflowRepository};
use crate::substrate::{
    Activity, ActivityOptions, BoxFuture, ChildWorkflow, ChildWorkflowOptions, DurableSubstrate,
    LocalSubstrate, RetryPolicy, ScheduleCallback, ScheduleRegistration, SignalReceiver,
    SubstrateError, WorkflowSignal,
};

// ---------------------------------------------------------------------------
// Workflow repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWorkflowRepository {
    definitions: Mutex<HashMap<String, StoredWorkflow>>,
    executions: Mutex<HashMap<Uuid, Execution>>,
}

impl MemoryWorkflowRepository {
    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

impl WorkflowRepository for MemoryWorkflowRepository {
    async fn save_definition(
        &self,
        def: &WorkflowDefinition,
        metadata: &DefinitionMetadata,
    ) -> Result<StoredWorkflow, RepositoryError> {
        let mut defs = self.definitions.lock().unwrap();
        let now = Utc::now();
        let created_at = defs.get(&def.id).map(|s| s.created_at).unwrap_or(now);
        let stored = StoredWorkflow {
            definition: def.clone(),
            metadata: metadata.clone(),
            created_at,
            updated_at: now,
        };
        defs.insert(def.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_definition(&self, id: &str) -> Result<Option<StoredWorkflow>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.definitions.lock().unwrap().contains_key(id))
    }

    async fn list_definitions(&self, owner: Option<&str>) -> Result<Vec<StoredWorkflow>, RepositoryError> {
        let mut list: Vec<StoredWorkflow> = self
            .definitions
            .lock()
            .unwrap()
            .values()
            .filter(|s| owner.is_none() || s.metadata.owner.as_deref() == owner)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.definition.id.cmp(&b.definition.id));
        Ok(list)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.definitions.lock().unwrap().remove(id).is_some())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        if executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!("execution {} exists", execution.id)));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        match executions.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.lock().unwrap().get(id).cloned())
    }

    async fn list_executions(&self, workflow_id: &str, limit: u32) -> Result<Vec<Execution>, RepositoryError> {
        let mut list: Vec<Execution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list.truncate(limit as usize);
        Ok(list)
    }

    async fn list_waiting_executions(&self) -> Result<Vec<Execution>, RepositoryError> {
        let mut list: Vec<Execution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == ExecutionStatus::WaitingForApproval)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(list)
    }
}

// ---------------------------------------------------------------------------
// Approval repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryApprovalRepository {
    requests: Mutex<HashMap<Uuid, ApprovalRequest>>,
}

impl ApprovalRepository for MemoryApprovalRepository {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        self.requests.lock().unwrap().insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self.requests.lock().unwrap().get(id).cloned())
    }

    async fn respond(&self, id: &Uuid, response: ApprovalResponse) -> Result<ApprovalRequest, RespondError> {
        let mut requests = self.requests.lock().unwrap();
        let request = requests.get_mut(id).ok_or(RespondError::NotFound)?;
        request.record_response(response)?;
        Ok(request.clone())
    }

    async fn mark_expired(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let mut requests = self.requests.lock().unwrap();
        let Some(request) = requests.get_mut(id) else {
            return Ok(None);
        };
        Ok(request.expire(now).then(|| request.clone()))
    }

    async fn list_pending_for_user(&self, who: &Approver) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut list: Vec<ApprovalRequest> = self
            .requests
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.status == ApprovalStatus::Pending
                    && r.is_listed_approver(who)
                    && !r.has_responded(&who.user_id)
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        Ok(self
            .requests
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Schedule repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryScheduleRepository {
    records: Mutex<HashMap<Uuid, ScheduleRecord>>,
}

impl ScheduleRepository for MemoryScheduleRepository {
    async fn create(&self, record: &ScheduleRecord) -> Result<(), RepositoryError> {
        self.records.lock().unwrap().insert(record.id, record.clone());
        Ok(())
    }

    async fn update(&self, record: &ScheduleRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.lock().unwrap().remove(id).is_some())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ScheduleRecord>, RepositoryError> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn get_by_workflow(&self, workflow_id: &str) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        let mut list: Vec<ScheduleRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| owner.is_none_or(|o| r.owner == o))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn record_run(&self, id: &Uuid, run: &ScheduleRun) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        record.last_run_at = Some(run.fired_at);
        record.run_count += 1;
        record.last_error = run.error.clone();
        record.next_run_at = run.next_run_at;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pending_sync(&self) -> Result<Vec<ScheduleRecord>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.sync_state == SyncState::PendingSync)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Scripted agent invoker
// ---------------------------------------------------------------------------

type Behavior = Arc<dyn Fn(&AgentInvocation) -> Result<AgentOutput, InvokeError> + Send + Sync>;

/// Agent invoker whose replies are scripted per agent id.
#[derive(Default, Clone)]
pub struct ScriptedInvoker {
    behaviors: Arc<Mutex<HashMap<String, (Behavior, Option<Duration>)>>>,
    calls: Arc<Mutex<Vec<AgentInvocation>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        self,
        agent_id: &str,
        behavior: impl Fn(&AgentInvocation) -> Result<AgentOutput, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), (Arc::new(behavior), None));
        self
    }

    pub fn reply(self, agent_id: &str, output: &str) -> Self {
        let output = output.to_string();
        self.with(agent_id, move |_| Ok(AgentOutput::ok(output.clone())))
    }

    /// Reply with the agent id and its resolved input, `"agent(input)"`.
    pub fn echo(self, agent_id: &str) -> Self {
        self.with(agent_id, |inv| Ok(AgentOutput::ok(format!("{}({})", inv.agent_id, inv.input))))
    }

    pub fn fail(self, agent_id: &str, error: &str) -> Self {
        let error = error.to_string();
        self.with(agent_id, move |_| Ok(AgentOutput::failed(error.clone())))
    }

    /// Reply after sleeping for `delay`.
    pub fn slow(self, agent_id: &str, output: &str, delay: Duration) -> Self {
        let output = output.to_string();
        self.behaviors.lock().unwrap().insert(
            agent_id.to_string(),
            (Arc::new(move |_: &AgentInvocation| Ok(AgentOutput::ok(output.clone()))), Some(delay)),
        );
        self
    }

    pub fn calls(&self) -> Vec<AgentInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, agent_id: &str) -> Vec<AgentInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.agent_id == agent_id)
            .collect()
    }
}

impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentOutput, InvokeError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let entry = self.behaviors.lock().unwrap().get(&invocation.agent_id).cloned();
        let Some((behavior, delay)) = entry else {
            return Err(InvokeError::UnknownAgent(invocation.agent_id.clone()));
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        behavior(invocation)
    }
}

// ---------------------------------------------------------------------------
// Substrate with injectable schedule failures
// ---------------------------------------------------------------------------

/// `LocalSubstrate` whose schedule operations can be forced to fail.
pub struct FaultySubstrate {
    inner: LocalSubstrate,
    schedule_error: Mutex<Option<SubstrateError>>,
}

impl FaultySubstrate {
    pub fn new() -> (Self, SignalReceiver) {
        let (inner, rx) = LocalSubstrate::new(fast_retry());
        (
            Self {
                inner,
                schedule_error: Mutex::new(None),
            },
            rx,
        )
    }

    pub fn fail_schedules_with(&self, error: Option<SubstrateError>) {
        *self.schedule_error.lock().unwrap() = error;
    }

    pub fn is_scheduled(&self, durable_id: &str) -> bool {
        self.inner.is_scheduled(durable_id)
    }

    pub fn schedule_count(&self) -> usize {
        self.inner.schedule_count()
    }

    fn injected(&self) -> Option<SubstrateError> {
        self.schedule_error.lock().unwrap().clone()
    }
}

impl DurableSubstrate for FaultySubstrate {
    fn name(&self) -> &str {
        "faulty"
    }

    fn execute_activity(&self, options: ActivityOptions, activity: Activity) -> BoxFuture<'_, Result<Value, SubstrateError>> {
        self.inner.execute_activity(options, activity)
    }

    fn execute_child_workflow(
        &self,
        options: ChildWorkflowOptions,
        body: ChildWorkflow,
    ) -> BoxFuture<'_, Result<Value, SubstrateError>> {
        self.inner.execute_child_workflow(options, body)
    }

    fn signal(&self, run_id: &str, signal: WorkflowSignal) -> BoxFuture<'_, Result<(), SubstrateError>> {
        self.inner.signal(run_id, signal)
    }

    fn register_schedule(
        &self,
        registration: ScheduleRegistration,
        callback: ScheduleCallback,
    ) -> BoxFuture<'_, Result<String, SubstrateError>> {
        match self.injected() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => self.inner.register_schedule(registration, callback),
        }
    }

    fn update_schedule(
        &self,
        durable_id: &str,
        registration: ScheduleRegistration,
    ) -> BoxFuture<'_, Result<(), SubstrateError>> {
        match self.injected() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => self.inner.update_schedule(durable_id, registration),
        }
    }

    fn delete_schedule(&self, durable_id: &str) -> BoxFuture<'_, Result<(), SubstrateError>> {
        match self.injected() {
            Some(err) => Box::pin(async move { Err(err) }),
            None => self.inner.delete_schedule(durable_id),
        }
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// Parse a definition from JSON, panicking on error.
pub fn definition(json: &str) -> WorkflowDefinition {
    serde_json::from_str(json).unwrap()
}
