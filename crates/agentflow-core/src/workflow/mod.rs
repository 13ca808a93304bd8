//! Workflow engine: definitions, interpretation, approvals and schedules.
//!
//! - `definition` -- JSON/YAML parsing, validation, file load/save
//! - `graph` -- step reference graph, cycle and reachability checks
//! - `namespace` -- per-execution variables and template resolution
//! - `condition` -- loop condition evaluation (keywords and JEXL)
//! - `cron` -- 5-field cron parsing, next-run search, descriptions
//! - `step_runner` -- agent, parallel, conditional and loop step handlers
//! - `checkpoint` -- execution persistence and suspension
//! - `approval` -- approval gate with quorum and expiry
//! - `executor` -- the step-graph interpreter and resume worker
//! - `schedule` -- cron schedules mirrored onto the durable substrate

pub mod approval;
pub mod checkpoint;
pub mod condition;
pub mod cron;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod namespace;
pub mod schedule;
pub mod step_runner;
