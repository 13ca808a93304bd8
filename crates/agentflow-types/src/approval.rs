//! Human approval request types.
//!
//! An `ApprovalRequest` is opened when an approval step runs. Responses are
//! append-only; status moves from `pending` to exactly one of `approved`,
//! `rejected` or `expired` and never changes afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("invalid approval status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => f.write_str("approve"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

/// One approver's vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub user_id: String,
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// Identity of someone acting on approvals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Approver {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Approver {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// Why a response could not be recorded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponseRejected {
    #[error("approval is no longer pending (status: {0})")]
    NotPending(ApprovalStatus),

    #[error("user '{0}' has already responded to this approval")]
    AlreadyResponded(String),
}

/// A pending or resolved request for human sign-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Durable run to signal when the request resolves.
    pub run_id: String,
    pub title: String,
    pub message: String,
    /// Snapshot of prior step outputs at the time the gate opened.
    #[serde(default)]
    pub context: serde_json::Value,
    pub approvers: Vec<String>,
    pub required_approvals: u32,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub responses: Vec<ApprovalResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// True if any configured approver entry matches `who`.
    pub fn is_listed_approver(&self, who: &Approver) -> bool {
        self.approvers.iter().any(|entry| approver_matches(entry, who))
    }

    pub fn has_responded(&self, user_id: &str) -> bool {
        self.responses.iter().any(|r| r.user_id == user_id)
    }

    pub fn approve_count(&self) -> usize {
        self.responses
            .iter()
            .filter(|r| r.decision == ApprovalDecision::Approve)
            .count()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.timeout_at.is_some_and(|at| at <= now)
    }

    /// Append a response and recompute status.
    ///
    /// A single rejection resolves the request as `rejected`. Approval needs
    /// `required_approvals` distinct approving responses. Callers must hold
    /// whatever lock makes this read-modify-write atomic.
    pub fn record_response(
        &mut self,
        response: ApprovalResponse,
    ) -> Result<ApprovalStatus, ResponseRejected> {
        if self.status != ApprovalStatus::Pending {
            return Err(ResponseRejected::NotPending(self.status));
        }
        if self.has_responded(&response.user_id) {
            return Err(ResponseRejected::AlreadyResponded(response.user_id));
        }

        let responded_at = response.responded_at;
        match response.decision {
            ApprovalDecision::Reject => {
                self.status = ApprovalStatus::Rejected;
                self.rejection_reason = Some(
                    response
                        .comment
                        .clone()
                        .filter(|c| !c.trim().is_empty())
                        .unwrap_or_else(|| format!("rejected by {}", response.user_id)),
                );
                self.resolved_at = Some(responded_at);
            }
            ApprovalDecision::Approve => {}
        }
        self.responses.push(response);

        if self.status == ApprovalStatus::Pending
            && self.approve_count() >= self.required_approvals.max(1) as usize
        {
            self.status = ApprovalStatus::Approved;
            self.resolved_at = Some(responded_at);
        }
        Ok(self.status)
    }

    /// Move a pending request to `expired`. Returns false if it was already
    /// resolved.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ApprovalStatus::Pending {
            return false;
        }
        self.status = ApprovalStatus::Expired;
        self.resolved_at = Some(now);
        true
    }
}

/// Match one approver entry: exact user id or email, `role:<name>`, or a
/// pattern with `*` wildcards checked against both user id and email.
pub fn approver_matches(entry: &str, who: &Approver) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    if let Some(role) = entry.strip_prefix("role:") {
        return who.roles.iter().any(|r| r.eq_ignore_ascii_case(role.trim()));
    }
    let candidates = std::iter::once(who.user_id.as_str()).chain(who.email.as_deref());
    if entry.contains('*') {
        return candidates.into_iter().any(|c| wildcard_match(entry, c));
    }
    candidates.into_iter().any(|c| c.eq_ignore_ascii_case(entry))
}

/// Case-insensitive glob match. Malformed patterns match nothing.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern).is_ok_and(|p| p.matches_with(text, options))
}
