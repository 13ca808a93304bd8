//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (agentflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod approval;
pub mod schedule;
pub mod workflow;

pub use approval::{ApprovalRepository, RespondError};
pub use schedule::ScheduleRepository;
pub use workflow::WorkflowRepository;
