//! Global configuration types for agentflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data
//! directory. Every section and field has a default, so an empty file (or
//! no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `~/.agentflow/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub substrate: SubstrateConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub schedules: ScheduleConfig,
    #[serde(default)]
    pub agents: AgentEndpointConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on API requests when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Applied to steps and branches without their own `timeout`.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Step outputs above this size are truncated.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Retry backoff for activities run by the in-process substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            retry_initial_backoff_ms: default_initial_backoff_ms(),
            retry_max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// How often pending approvals are checked for expiry.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// How often schedules in `pending_sync` are pushed again.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

/// Where agent invocations are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    #[serde(default = "default_agent_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_agent_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: default_agent_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.executor.default_step_timeout_secs, 300);
        assert_eq!(config.executor.max_output_bytes, 1024 * 1024);
        assert_eq!(config.approvals.sweep_interval_secs, 60);
        assert!(config.server.api_key.is_none());
        assert!(!config.telemetry.otel_enabled);
    }

    #[test]
    fn test_global_config_deserialize_with_defaults() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.substrate.retry_initial_backoff_ms, 500);
        assert_eq!(config.schedules.reconcile_interval_secs, 300);
    }

    #[test]
    fn test_global_config_deserialize_with_values() {
        let toml_str = r#"
[server]
port = 9000
api_key = "secret"

[executor]
default_step_timeout_secs = 60

[agents]
endpoint = "http://agents.internal:9090"
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.executor.default_step_timeout_secs, 60);
        assert_eq!(config.executor.max_output_bytes, 1024 * 1024);
        assert_eq!(config.agents.endpoint, "http://agents.internal:9090");
        assert_eq!(config.agents.request_timeout_secs, 600);
    }
}
