//! Observability setup for agentflow: structured logging through
//! `tracing-subscriber` and optional OpenTelemetry span export.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
