//! Human approval gate.
//!
//! An approval step opens a request and parks its execution. Approvers
//! respond from outside the executor. When a response moves the request to
//! `approved` or `rejected`, or the expiry sweep moves it to `expired`, the
//! gate signals the parked run through the durable substrate with the
//! decision.
//!
//! The quorum check-and-append is done by `ApprovalRepository::respond`,
//! which runs atomically, so near-simultaneous approvals cannot lose votes.

use std::sync::Arc;
use std::time::Duration;

use agentflow_types::approval::{
    ApprovalDecision, ApprovalRequest, ApprovalResponse, ApprovalStatus, Approver,
    ResponseRejected,
};
use agentflow_types::error::RepositoryError;
use agentflow_types::event::WorkflowEvent;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::{ApprovalRepository, RespondError};
use crate::substrate::{ApprovalOutcome, DurableSubstrate, WorkflowSignal};

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request is already {0}")]
    NotPending(ApprovalStatus),

    #[error("user '{0}' is not an approver for this request")]
    NotApprover(String),

    #[error("user '{0}' has already responded to this request")]
    AlreadyResponded(String),

    #[error("approval step '{0}' has no approvers configured")]
    NoApprovers(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Everything needed to open a request for one approval step.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub step_id: String,
    pub run_id: String,
    pub title: String,
    pub message: String,
    /// Snapshot of prior step outputs.
    pub context: Value,
    pub approvers: Vec<String>,
    pub required_approvals: u32,
    pub timeout_secs: Option<u64>,
    pub created_by: Option<String>,
}

/// Result of a response submission.
#[derive(Debug, Clone)]
pub struct RespondOutcome {
    pub request: ApprovalRequest,
    /// Whether the parked execution was signalled to resume.
    pub resumed: bool,
}

pub struct ApprovalGate<A: ApprovalRepository> {
    repo: Arc<A>,
    substrate: Arc<dyn DurableSubstrate>,
    events: EventBus,
}

impl<A: ApprovalRepository> Clone for ApprovalGate<A> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            substrate: Arc::clone(&self.substrate),
            events: self.events.clone(),
        }
    }
}

impl<A: ApprovalRepository> ApprovalGate<A> {
    pub fn new(repo: Arc<A>, substrate: Arc<dyn DurableSubstrate>, events: EventBus) -> Self {
        Self {
            repo,
            substrate,
            events,
        }
    }

    pub fn repo(&self) -> &A {
        &self.repo
    }

    /// Create a pending request. Fails if no approver is configured.
    pub async fn open(&self, new: NewApproval) -> Result<ApprovalRequest, ApprovalError> {
        let approvers: Vec<String> = new
            .approvers
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if approvers.is_empty() {
            return Err(ApprovalError::NoApprovers(new.step_id));
        }

        let now = Utc::now();
        let timeout_at = new
            .timeout_secs
            .map(|secs| now + chrono::Duration::seconds(secs.min(i32::MAX as u64) as i64));
        let request = ApprovalRequest {
            id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            execution_id: new.execution_id,
            step_id: new.step_id,
            run_id: new.run_id,
            title: new.title,
            message: new.message,
            context: new.context,
            approvers,
            required_approvals: new.required_approvals.max(1),
            status: ApprovalStatus::Pending,
            rejection_reason: None,
            responses: Vec::new(),
            timeout_at,
            created_by: new.created_by,
            created_at: now,
            resolved_at: None,
        };
        self.repo.create(&request).await?;

        tracing::info!(
            approval_id = %request.id,
            execution_id = %request.execution_id,
            step_id = request.step_id.as_str(),
            required = request.required_approvals,
            "approval requested"
        );
        self.events.publish(WorkflowEvent::ApprovalRequested {
            approval_id: request.id,
            execution_id: request.execution_id,
            step_id: request.step_id.clone(),
            approvers: request.approvers.clone(),
        });
        Ok(request)
    }

    /// Record one approver's decision.
    pub async fn respond(
        &self,
        id: Uuid,
        who: &Approver,
        decision: ApprovalDecision,
        comment: Option<String>,
    ) -> Result<RespondOutcome, ApprovalError> {
        let current = self.get(id).await?;
        if current.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending(current.status));
        }
        if !current.is_listed_approver(who) {
            return Err(ApprovalError::NotApprover(who.user_id.clone()));
        }

        let response = ApprovalResponse {
            user_id: who.user_id.clone(),
            decision,
            comment,
            responded_at: Utc::now(),
        };
        let request = self.repo.respond(&id, response).await.map_err(|e| match e {
            RespondError::NotFound => ApprovalError::NotFound(id),
            RespondError::Rejected(ResponseRejected::NotPending(status)) => ApprovalError::NotPending(status),
            RespondError::Rejected(ResponseRejected::AlreadyResponded(user)) => {
                ApprovalError::AlreadyResponded(user)
            }
            RespondError::Repository(e) => ApprovalError::Repository(e),
        })?;

        tracing::info!(
            approval_id = %id,
            user_id = who.user_id.as_str(),
            decision = %decision,
            status = %request.status,
            "approval response recorded"
        );

        let resumed = if request.status.is_terminal() {
            self.notify(&request).await
        } else {
            false
        };
        Ok(RespondOutcome { request, resumed })
    }

    pub async fn get(&self, id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.repo.get(&id).await?.ok_or(ApprovalError::NotFound(id))
    }

    pub async fn list_pending_for_user(&self, who: &Approver) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        Ok(self.repo.list_pending_for_user(who).await?)
    }

    /// Expire every pending request past its deadline and wake its run.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let mut expired = Vec::new();
        for request in self.repo.list_overdue(now).await? {
            if let Some(request) = self.repo.mark_expired(&request.id, now).await? {
                tracing::info!(
                    approval_id = %request.id,
                    execution_id = %request.execution_id,
                    "approval request expired"
                );
                self.notify(&request).await;
                expired.push(request);
            }
        }
        Ok(expired)
    }

    /// Run `expire_overdue` every `interval` until cancelled.
    pub fn spawn_expiry_sweeper(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()>
    where
        A: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.expire_overdue(Utc::now()).await {
                            tracing::warn!(error = %e, "approval expiry sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("approval expiry sweeper stopped");
        })
    }

    /// Publish the resolution and signal the parked run. Returns whether the
    /// signal was delivered.
    async fn notify(&self, request: &ApprovalRequest) -> bool {
        self.events.publish(WorkflowEvent::ApprovalResolved {
            approval_id: request.id,
            execution_id: request.execution_id,
            status: request.status,
        });

        let Some(signal) = resolution_signal(request) else {
            return false;
        };
        match self.substrate.signal(&request.run_id, signal).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    approval_id = %request.id,
                    run_id = request.run_id.as_str(),
                    error = %e,
                    "failed to signal suspended execution"
                );
                false
            }
        }
    }
}

/// The resume signal for a resolved request, or `None` while it is pending.
pub fn resolution_signal(request: &ApprovalRequest) -> Option<WorkflowSignal> {
    let outcome = match request.status {
        ApprovalStatus::Approved => ApprovalOutcome::Approved,
        ApprovalStatus::Rejected => ApprovalOutcome::Rejected {
            reason: request
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "rejected".to_string()),
        },
        ApprovalStatus::Expired => ApprovalOutcome::Expired,
        ApprovalStatus::Pending => return None,
    };
    Some(WorkflowSignal::ApprovalResolved {
        execution_id: request.execution_id,
        step_id: request.step_id.clone(),
        approval_id: request.id,
        outcome,
    })
}
