//! HTTP request handlers for the REST API.

pub mod approval;
pub mod cron;
pub mod schedule;
pub mod workflow;
