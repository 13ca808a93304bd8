//! Business logic and repository trait definitions for AgentFlow.
//!
//! This crate defines the "ports" (repository traits, agent invoker, durable
//! substrate) that the infrastructure layer implements. It depends only on
//! `agentflow-types` -- never on `agentflow-infra` or any database crate.

pub mod agent;
pub mod event;
pub mod repository;
pub mod substrate;
pub mod workflow;

#[cfg(test)]
mod test_support;
