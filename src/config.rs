use anyhow::Result;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::ActiveTicketPolicy;

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub polling: PollingConfig,
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Ticket statuses that still receive new proposal steps; "" means no status
    pub active_statuses: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://localhost:3000".to_string(),
                timeout_secs: 30,
            },
            cache: CacheConfig {
                path: ".artifact_cache".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
            polling: PollingConfig { interval_ms: 3000 },
            negotiation: NegotiationConfig {
                active_statuses: ActiveTicketPolicy::DEFAULT_STATUSES
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("negotiation").required(false));
        Self::finish(builder)
    }

    /// Load defaults overlaid with one explicit file, then the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let builder = Self::defaults()?.add_source(File::from(path).required(true));
        Self::finish(builder)
    }

    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("api.base_url", defaults.api.base_url)?
            .set_default("api.timeout_secs", defaults.api.timeout_secs)?
            .set_default("cache.path", defaults.cache.path)?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", defaults.logging.format)?
            .set_default("polling.interval_ms", defaults.polling.interval_ms)?
            .set_default("negotiation.active_statuses", defaults.negotiation.active_statuses)?;
        if let Some(file_path) = defaults.logging.file_path {
            builder = builder.set_default("logging.file_path", file_path)?;
        }
        Ok(builder)
    }

    fn finish(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder
            // NEGOTIATION__API__BASE_URL and friends
            .add_source(
                Environment::with_prefix("NEGOTIATION")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("negotiation.active_statuses")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let base_url = self.api.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "api.base_url must be an http(s) URL, got {:?}",
                self.api.base_url
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(anyhow::anyhow!("timeout_secs must be greater than 0"));
        }
        if self.cache.path.trim().is_empty() {
            return Err(anyhow::anyhow!("cache.path must not be empty"));
        }
        if self.polling.interval_ms == 0 {
            return Err(anyhow::anyhow!("interval_ms must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        if self.negotiation.active_statuses.is_empty() {
            return Err(anyhow::anyhow!("active_statuses must name at least one status"));
        }

        Ok(())
    }

    /// Request timeout for the gateway
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Message poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Directory of the local artifact cache
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache.path)
    }

    /// The configured active-ticket rule
    #[must_use]
    pub fn active_policy(&self) -> ActiveTicketPolicy {
        ActiveTicketPolicy::from_statuses(&self.negotiation.active_statuses)
    }

    /// Get log level from environment or config
    #[must_use]
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}
