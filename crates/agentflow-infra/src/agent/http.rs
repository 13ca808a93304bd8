//! HTTP agent invoker.
//!
//! Sends `POST {endpoint}/agents/{agent_id}/invoke` with `{input, user_id}`
//! and expects an `AgentOutput` body (`success`, `output`, `error`, optional
//! `context_updates`). The per-call timeout comes from the invocation, capped
//! by `with_max_request_timeout` when set.

use std::time::Duration;

use agentflow_core::agent::{AgentInvocation, AgentInvoker, AgentOutput, InvokeError};
use serde::Serialize;

/// Request body sent to the agent runtime.
#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    execution_id: String,
    step_id: &'a str,
}

/// [`AgentInvoker`] backed by a remote agent runtime.
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    base_url: String,
    max_request_timeout: Option<Duration>,
}

impl HttpAgentInvoker {
    /// Build an invoker for `endpoint`. `connect_timeout` bounds connection
    /// setup; the overall request deadline is per invocation.
    pub fn new(endpoint: &str, connect_timeout: Duration) -> Result<Self, InvokeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| InvokeError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            max_request_timeout: None,
        })
    }

    /// Cap every call at `limit`, whatever the step asks for.
    pub fn with_max_request_timeout(mut self, limit: Duration) -> Self {
        self.max_request_timeout = Some(limit);
        self
    }

    fn request_timeout(&self, requested: Duration) -> Duration {
        self.max_request_timeout
            .map_or(requested, |limit| requested.min(limit))
    }

    fn url(&self, agent_id: &str) -> String {
        format!("{}/agents/{agent_id}/invoke", self.base_url)
    }
}

impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, invocation: &AgentInvocation) -> Result<AgentOutput, InvokeError> {
        let body = InvokeRequest {
            input: &invocation.input,
            user_id: invocation.user_id.as_deref(),
            execution_id: invocation.execution_id.to_string(),
            step_id: &invocation.step_id,
        };

        let timeout = self.request_timeout(invocation.timeout);
        tracing::debug!(
            agent_id = %invocation.agent_id,
            step_id = %invocation.step_id,
            execution_id = %invocation.execution_id,
            "invoking agent over HTTP"
        );

        let response = self
            .client
            .post(self.url(&invocation.agent_id))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::Timeout {
                        agent_id: invocation.agent_id.clone(),
                        timeout,
                    }
                } else {
                    InvokeError::Unreachable(format!("HTTP request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                404 => InvokeError::UnknownAgent(invocation.agent_id.clone()),
                _ => InvokeError::Protocol(format!("HTTP {status}: {error_body}")),
            });
        }

        response.json::<AgentOutput>().await.map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout {
                    agent_id: invocation.agent_id.clone(),
                    timeout,
                }
            } else {
                InvokeError::Protocol(format!("failed to parse response: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use uuid::Uuid;

    async fn agent_handler(Path(agent_id): Path<String>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        match agent_id.as_str() {
            "echo" => (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "output": format!("{}|{}", body["input"].as_str().unwrap_or(""), body["user_id"].as_str().unwrap_or("-")),
                    "context_updates": {"seen": true}
                })),
            ),
            "broken" => (StatusCode::OK, Json(json!({"success": false, "error": "model refused"}))),
            "garbage" => (StatusCode::OK, Json(json!(["not", "an", "object"]))),
            "crash" => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"}))),
            "sleepy" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                (StatusCode::OK, Json(json!({"success": true, "output": "late"})))
            }
            _ => (StatusCode::NOT_FOUND, Json(json!({"error": "no such agent"}))),
        }
    }

    async fn spawn_agent_server() -> String {
        let app = Router::new().route("/agents/{agent_id}/invoke", post(agent_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn invocation(agent_id: &str, timeout: Duration) -> AgentInvocation {
        AgentInvocation {
            agent_id: agent_id.to_string(),
            input: "summarize".to_string(),
            user_id: Some("u1".to_string()),
            execution_id: Uuid::now_v7(),
            step_id: "draft".to_string(),
            timeout,
        }
    }

    async fn invoker() -> HttpAgentInvoker {
        let endpoint = spawn_agent_server().await;
        HttpAgentInvoker::new(&endpoint, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let invoker = invoker().await;
        let out = invoker.invoke(&invocation("echo", Duration::from_secs(5))).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, "summarize|u1");
        assert_eq!(out.context_updates["seen"], true);
    }

    #[tokio::test]
    async fn test_agent_reported_failure_is_ok_output() {
        let invoker = invoker().await;
        let out = invoker.invoke(&invocation("broken", Duration::from_secs(5))).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("model refused"));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let invoker = invoker().await;
        let err = invoker
            .invoke(&invocation("ghost", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UnknownAgent(ref id) if id == "ghost"), "got: {err}");
    }

    #[tokio::test]
    async fn test_server_error_and_bad_body_are_protocol_errors() {
        let invoker = invoker().await;
        let err = invoker
            .invoke(&invocation("crash", Duration::from_secs(5)))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("500"), "got: {msg}");

        let err = invoker
            .invoke(&invocation("garbage", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Protocol(_)), "got: {err}");
    }

    #[tokio::test]
    async fn test_timeout() {
        let invoker = invoker().await;
        let err = invoker
            .invoke(&invocation("sleepy", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn test_max_request_timeout_caps_step_timeout() {
        let invoker = invoker().await.with_max_request_timeout(Duration::from_millis(200));
        let err = invoker
            .invoke(&invocation("sleepy", Duration::from_secs(30)))
            .await
            .unwrap_err();
        match err {
            InvokeError::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_millis(200)),
            other => panic!("expected timeout, got: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let invoker = HttpAgentInvoker::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap();
        let err = invoker
            .invoke(&invocation("echo", Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Unreachable(_)), "got: {err}");
    }
}
