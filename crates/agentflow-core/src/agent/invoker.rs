//! Agent invocation port.
//!
//! Follows the blanket-impl pattern used for other pluggable collaborators:
//! 1. `AgentInvoker` uses native async fn in traits
//! 2. `AgentInvokerDyn` is the object-safe twin with boxed futures
//! 3. `BoxAgentInvoker` wraps `Arc<dyn AgentInvokerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One request to run an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInvocation {
    pub agent_id: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub execution_id: Uuid,
    pub step_id: String,
    #[serde(skip)]
    pub timeout: Duration,
}

/// What an agent returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Keys merged into the execution's `context` namespace.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context_updates: Map<String, Value>,
}

impl AgentOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Transport-level failures. An agent that ran and reported
/// `success: false` is an `Ok(AgentOutput)`, not an error.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("agent '{0}' not found")]
    UnknownAgent(String),

    #[error("agent '{agent_id}' timed out after {}s", .timeout.as_secs())]
    Timeout { agent_id: String, timeout: Duration },

    #[error("agent endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("invalid agent response: {0}")]
    Protocol(String),
}

/// Runs agents on behalf of the executor.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        invocation: &AgentInvocation,
    ) -> impl Future<Output = Result<AgentOutput, InvokeError>> + Send;
}

/// Object-safe version of [`AgentInvoker`] with boxed futures.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, InvokeError>> + Send + 'a>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, InvokeError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation))
    }
}

/// Type-erased, cheaply cloneable agent invoker.
#[derive(Clone)]
pub struct BoxAgentInvoker {
    inner: Arc<dyn AgentInvokerDyn>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Arc::new(invoker),
        }
    }

    pub async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentOutput, InvokeError> {
        self.inner.invoke_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxAgentInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentInvoker").finish_non_exhaustive()
    }
}
