//! Engine configuration loader for Tradeflow.
//!
//! Reads `config.toml` from the data directory (`~/.tradeflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use tradeflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with floors applied.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => apply_floors(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Zero workers or a zero poll interval would stall the engine.
fn apply_floors(mut config: EngineConfig) -> EngineConfig {
    if config.max_workers == 0 {
        tracing::warn!("max_workers = 0 in config.toml, using 1");
        config.max_workers = 1;
    }
    if config.poll_interval_secs == 0 {
        tracing::warn!("poll_interval_secs = 0 in config.toml, using 1");
        config.poll_interval_secs = 1;
    }
    if config.default_step_timeout_secs == 0 {
        config.default_step_timeout_secs = EngineConfig::default().default_step_timeout_secs;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_workers, 5);
        assert!(config.notification_webhook_url.is_none());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_workers = 8
poll_interval_secs = 10
optional_steps_skip_unmet_dependencies = true
ai_endpoint = "http://localhost:11434/v1/chat/completions"
ai_model = "llama3"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.poll_interval_secs, 10);
        assert!(config.optional_steps_skip_unmet_dependencies);
        assert_eq!(config.ai_model, "llama3");
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.poll_interval_secs, 60);
    }

    #[tokio::test]
    async fn load_engine_config_enforces_floors() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "max_workers = 0\npoll_interval_secs = 0\ndefault_step_timeout_secs = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.default_step_timeout_secs, 300);
    }
}
