//! Hearth configuration: defaults, optional file, then `HEARTH_*` environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | HEARTH_CONFIG | config/hearth | Path of the optional config file (toml). |
//! | HEARTH_PORT | 8010 | HTTP port of the gateway add-on. |
//! | HEARTH_STORE_BACKEND | sled | `memory` or `sled`. |
//! | HEARTH_MODERATION__ENABLED | true | Master switch for the remote classifier. |
//! | HEARTH_MODERATION__FAILURE_POLICY | fail_open | `fail_open` delivers when moderation is unavailable; `fail_closed` rejects. |
//! | HEARTH_MODERATION_API_KEY / OPENROUTER_API_KEY | (none) | Bearer key for the classifier when not set in file. |

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/hearth";
const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

/// What the tone gate does when the classifier cannot produce a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deliver the message unscreened. Family communication is never blocked by infrastructure.
    #[default]
    FailOpen,
    /// Reject the draft (preserved) until the classifier is reachable again.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sled,
}

/// Remote classifier, admission control and breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u32,
    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,
    #[serde(default = "default_breaker_min_requests")]
    pub breaker_min_requests: u32,
    /// Error ratio that must be *exceeded* to open the breaker.
    #[serde(default = "default_breaker_error_ratio")]
    pub breaker_error_ratio: f64,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// USD per 1000 prompt tokens, for the accounting log only.
    #[serde(default)]
    pub cost_per_1k_prompt_tokens: f64,
    #[serde(default)]
    pub cost_per_1k_completion_tokens: f64,
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_output_tokens() -> u32 {
    400
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_capacity() -> u32 {
    100
}

fn default_breaker_window_secs() -> u64 {
    300
}

fn default_breaker_min_requests() -> u32 {
    4
}

fn default_breaker_error_ratio() -> f64 {
    0.5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_api_base(),
            api_key: None,
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_capacity: default_rate_limit_capacity(),
            breaker_window_secs: default_breaker_window_secs(),
            breaker_min_requests: default_breaker_min_requests(),
            breaker_error_ratio: default_breaker_error_ratio(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            failure_policy: FailurePolicy::FailOpen,
            cost_per_1k_prompt_tokens: 0.0,
            cost_per_1k_completion_tokens: 0.0,
        }
    }
}

impl ModerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.breaker_window_secs.max(1))
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    /// API key from config, falling back to `HEARTH_MODERATION_API_KEY` then `OPENROUTER_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| env_opt_string("HEARTH_MODERATION_API_KEY"))
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.breaker_error_ratio) {
            return Err(ConfigError::Invalid {
                field: "moderation.breaker_error_ratio",
                reason: format!("{} is outside 0.0..=1.0", self.breaker_error_ratio),
            });
        }
        if self.rate_limit_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "moderation.rate_limit_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_output_tokens == 0 {
            return Err(ConfigError::Invalid {
                field: "moderation.max_output_tokens",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration shared by the core services and the gateway add-on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HearthConfig {
    pub app_name: String,
    pub port: u16,
    /// Base directory for the sled message store.
    pub storage_path: String,
    #[serde(default)]
    pub store_backend: StoreBackend,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            app_name: "Hearth".to_string(),
            port: 8010,
            storage_path: "./data".to_string(),
            store_backend: StoreBackend::default(),
            moderation: ModerationConfig::default(),
        }
    }
}

impl HearthConfig {
    /// Load config from file and environment. Precedence: env `HEARTH_*` > file (`HEARTH_CONFIG`
    /// or `config/hearth`) > defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("HEARTH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("app_name", defaults.app_name.as_str())?
            .set_default("port", i64::from(defaults.port))?
            .set_default("storage_path", defaults.storage_path.as_str())?
            .set_default("store_backend", "sled")?;

        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::with_name(&path.to_string_lossy()).required(false))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("HEARTH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.moderation.validate()?;
        Ok(cfg)
    }

    pub fn sled_path(&self) -> std::path::PathBuf {
        Path::new(&self.storage_path).join("hearth_messages")
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
