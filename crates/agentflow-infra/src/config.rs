//! Global configuration loader for agentflow.
//!
//! Reads `config.toml` from the data directory (`~/.agentflow/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use agentflow_types::config::GlobalConfig;

/// Resolve the data directory.
///
/// Priority:
/// 1. Explicit override (the `--data-dir` flag)
/// 2. `AGENTFLOW_DATA_DIR` environment variable
/// 3. `~/.agentflow`
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(dir) = std::env::var("AGENTFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".agentflow");
    }

    PathBuf::from(".agentflow")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.approvals.sweep_interval_secs, 60);
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[server]
port = 9100
api_key = "k-123"

[agents]
endpoint = "http://agents:9000"
request_timeout_secs = 30

[telemetry]
otel_enabled = true
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.agents.endpoint, "http://agents:9000");
        assert_eq!(config.agents.request_timeout_secs, 30);
        assert!(config.telemetry.otel_enabled);
        assert_eq!(config.executor.default_step_timeout_secs, 300);
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[server\nport = ")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.server.port, 7878);
    }

    #[tokio::test]
    async fn load_global_config_wrong_type_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[server]\nport = \"high\"\n")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.server.port, 7878);
    }

    #[test]
    fn resolve_data_dir_prefers_override() {
        let dir = resolve_data_dir(Some(Path::new("/srv/agentflow")));
        assert_eq!(dir, PathBuf::from("/srv/agentflow"));
    }

    #[test]
    fn resolve_data_dir_defaults_to_agentflow_dir() {
        if std::env::var("AGENTFLOW_DATA_DIR").is_ok() {
            return;
        }
        let dir = resolve_data_dir(None);
        assert!(dir.ends_with(".agentflow"), "got: {}", dir.display());
    }
}
