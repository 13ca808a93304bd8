//! Event bus for execution lifecycle notifications.
//!
//! The executor and approval gate publish `WorkflowEvent`s here; the HTTP
//! layer and the logging subscriber consume them.

pub mod bus;

pub use bus::EventBus;
