//! Agent invokers.

pub mod http;

pub use http::HttpAgentInvoker;
