//! Agent invocation collaborator.

pub mod invoker;

pub use invoker::{AgentInvocation, AgentInvoker, AgentOutput, BoxAgentInvoker, InvokeError};
