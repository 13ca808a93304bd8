//! Approval repository trait definition.

use agentflow_types::approval::{ApprovalRequest, ApprovalResponse, Approver, ResponseRejected};
use agentflow_types::error::RepositoryError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Why `respond` did not record a response.
#[derive(Debug, thiserror::Error)]
pub enum RespondError {
    #[error("approval request not found")]
    NotFound,

    #[error(transparent)]
    Rejected(#[from] ResponseRejected),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Storage for approval requests.
///
/// `respond` and `mark_expired` are the only mutations after creation and
/// must each be atomic: load, apply, and store under one lock or
/// transaction, so concurrent approvers never lose each other's votes.
pub trait ApprovalRepository: Send + Sync {
    fn create(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Append a response via `ApprovalRequest::record_response` and return
    /// the updated request.
    fn respond(
        &self,
        id: &Uuid,
        response: ApprovalResponse,
    ) -> impl std::future::Future<Output = Result<ApprovalRequest, RespondError>> + Send;

    /// Expire a pending request. Returns the updated request, or `None` if
    /// it was missing or already resolved.
    fn mark_expired(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Pending requests that list this user (by id, email, role or
    /// wildcard) and that they have not answered yet, oldest first.
    fn list_pending_for_user(
        &self,
        who: &Approver,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// Pending requests whose `timeout_at` is at or before `now`.
    fn list_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;
}
