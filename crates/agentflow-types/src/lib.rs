//! Shared domain types for agentflow.
//!
//! Workflow definitions, executions, approval requests, schedules, events,
//! configuration, and the repository error type shared by every adapter.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod schedule;
pub mod workflow;
