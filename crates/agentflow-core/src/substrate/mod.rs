//! Durable execution substrate port.
//!
//! The executor and schedule service never talk to a durable-execution
//! engine directly; they go through `DurableSubstrate`, passed in at
//! construction. The substrate provides:
//! - retryable activities bounded by one deadline across all attempts
//! - child workflows (isolated sub-runs with their own deadline)
//! - signals that wake a suspended execution
//! - calendar schedules built from parsed cron sets
//!
//! `LocalSubstrate` is the in-process implementation.

pub mod local;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::cron::CalendarSpec;

pub use futures_util::future::BoxFuture;
pub use local::{LocalSubstrate, SignalEnvelope, SignalReceiver};
pub use retry::RetryPolicy;

/// Activity body. Called once per attempt with the 1-based attempt number.
pub type Activity = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Child workflow body. Runs exactly once.
pub type ChildWorkflow = BoxFuture<'static, Result<Value, String>>;

/// Invoked on every schedule fire.
pub type ScheduleCallback = Arc<dyn Fn(ScheduleFire) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubstrateError {
    #[error("activity '{activity_id}' failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        activity_id: String,
        attempts: u32,
        message: String,
    },

    #[error("'{id}' timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("child workflow '{child_id}' failed: {message}")]
    ChildFailed { child_id: String, message: String },

    #[error("durable substrate unavailable: {0}")]
    Unavailable(String),

    #[error("schedule rejected: {0}")]
    ScheduleRejected(String),

    #[error("'{0}' not found")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Options and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub activity_id: String,
    /// Deadline for the whole activity, retries and backoff included.
    pub timeout: Duration,
    /// Total attempts including the first, at least 1.
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ChildWorkflowOptions {
    pub child_id: String,
    pub timeout: Duration,
}

/// Outcome carried by an approval signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected { reason: String },
    Expired,
}

/// Typed message delivered to a suspended execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowSignal {
    ApprovalResolved {
        execution_id: Uuid,
        step_id: String,
        approval_id: Uuid,
        outcome: ApprovalOutcome,
    },
}

/// Calendar schedule mirrored from a `ScheduleRecord`.
#[derive(Debug, Clone)]
pub struct ScheduleRegistration {
    pub schedule_id: Uuid,
    pub workflow_id: String,
    pub calendar: CalendarSpec,
    pub timezone: Tz,
}

impl ScheduleRegistration {
    /// Durable id derived from the schedule row id.
    pub fn durable_id(&self) -> String {
        format!("schedule-{}", self.schedule_id)
    }
}

/// One schedule tick.
#[derive(Debug, Clone)]
pub struct ScheduleFire {
    pub schedule_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// DurableSubstrate trait
// ---------------------------------------------------------------------------

/// Object-safe handle to a durable-execution engine.
pub trait DurableSubstrate: Send + Sync {
    fn name(&self) -> &str;

    /// Run an activity, retrying failed or timed-out attempts up to
    /// `options.max_attempts`.
    fn execute_activity(
        &self,
        options: ActivityOptions,
        activity: Activity,
    ) -> BoxFuture<'_, Result<Value, SubstrateError>>;

    fn execute_child_workflow(
        &self,
        options: ChildWorkflowOptions,
        body: ChildWorkflow,
    ) -> BoxFuture<'_, Result<Value, SubstrateError>>;

    /// Deliver a signal to the run identified by `run_id`.
    fn signal(
        &self,
        run_id: &str,
        signal: WorkflowSignal,
    ) -> BoxFuture<'_, Result<(), SubstrateError>>;

    /// Register a schedule and return its durable id. Registering an id
    /// that already exists replaces it.
    fn register_schedule(
        &self,
        registration: ScheduleRegistration,
        callback: ScheduleCallback,
    ) -> BoxFuture<'_, Result<String, SubstrateError>>;

    /// Push a new calendar for an existing schedule.
    fn update_schedule(
        &self,
        durable_id: &str,
        registration: ScheduleRegistration,
    ) -> BoxFuture<'_, Result<(), SubstrateError>>;

    fn delete_schedule(&self, durable_id: &str) -> BoxFuture<'_, Result<(), SubstrateError>>;
}
