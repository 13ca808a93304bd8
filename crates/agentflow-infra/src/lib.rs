//! Infrastructure layer for agentflow.
//!
//! Contains implementations of the ports defined in `agentflow-core`:
//! SQLite repositories for workflows, executions, approvals and schedules,
//! the HTTP agent invoker, and the `config.toml` loader.

pub mod agent;
pub mod config;
pub mod sqlite;
