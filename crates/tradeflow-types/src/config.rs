//! Engine configuration for Tradeflow.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! worker pool, scheduler cadence, step dispatch policy, and the endpoints
//! used by the I/O-backed step executors.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.tradeflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of parallel-batch steps running at once (shared pool).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds between scheduler polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Step timeout used by definition files that omit `timeout_seconds`.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Treat unregistered custom step kinds as identity no-ops instead of
    /// failing the step.
    #[serde(default)]
    pub allow_unregistered_custom_steps: bool,

    /// Skip (rather than abort on) optional steps whose dependencies did not
    /// complete.
    #[serde(default)]
    pub optional_steps_skip_unmet_dependencies: bool,

    /// Request timeout for HTTP-backed executors.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Webhook that receives `notification` steps. Unset means log only.
    #[serde(default)]
    pub notification_webhook_url: Option<String>,

    /// HMAC-SHA256 key used to sign webhook notifications.
    #[serde(default)]
    pub notification_signing_secret: Option<String>,

    /// OpenAI-compatible chat completions endpoint for `ai_process` steps.
    #[serde(default)]
    pub ai_endpoint: Option<String>,

    #[serde(default = "default_ai_model")]
    pub ai_model: String,
}

fn default_max_workers() -> usize {
    5
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            default_step_timeout_secs: default_step_timeout_secs(),
            allow_unregistered_custom_steps: false,
            optional_steps_skip_unmet_dependencies: false,
            http_timeout_secs: default_http_timeout_secs(),
            notification_webhook_url: None,
            notification_signing_secret: None,
            ai_endpoint: None,
            ai_model: default_ai_model(),
        }
    }
}
