// Configuration File Support
//
// TOML configuration with environment variable overrides.
// Default location: ~/.config/hookcast/config.toml (platform config dir).

use crate::webhooks::delivery::DEFAULT_USER_AGENT;
use crate::webhooks::retry::{RetrySettings, DEFAULT_MAX_RETRIES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on configured retries; backoff before retry 16 is already
/// 2^16 units.
pub const MAX_CONFIGURED_RETRIES: u32 = 16;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Delivery configuration
    pub delivery: DeliveryConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Backoff unit in milliseconds; retry n waits unit * 2^n
    pub backoff_unit_ms: u64,

    /// User-Agent sent with every attempt
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit_ms: 1000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Scheduler settings derived from this section
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            attempt_timeout: Duration::from_secs(self.timeout_secs),
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to register Prometheus metrics
    pub enabled: bool,
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// Returns defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "hookcast", "hookcast") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("hookcast").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - HOOKCAST_LOG_LEVEL
    /// - HOOKCAST_LOG_FORMAT
    /// - HOOKCAST_TIMEOUT_SECS
    /// - HOOKCAST_MAX_RETRIES
    /// - HOOKCAST_BACKOFF_UNIT_MS
    /// - HOOKCAST_USER_AGENT
    /// - HOOKCAST_METRICS_ENABLED
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; unparseable or out-of-range
    /// values are ignored
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("HOOKCAST_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("HOOKCAST_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(timeout) = lookup("HOOKCAST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            if timeout > 0 {
                self.delivery.timeout_secs = timeout;
            }
        }
        if let Some(retries) = lookup("HOOKCAST_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            if retries <= MAX_CONFIGURED_RETRIES {
                self.delivery.max_retries = retries;
            }
        }
        if let Some(unit) = lookup("HOOKCAST_BACKOFF_UNIT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.delivery.backoff_unit_ms = unit;
        }
        if let Some(agent) = lookup("HOOKCAST_USER_AGENT") {
            if !agent.trim().is_empty() {
                self.delivery.user_agent = agent;
            }
        }

        if let Some(enabled) = lookup("HOOKCAST_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.delivery.timeout_secs == 0 {
            anyhow::bail!("Delivery timeout must be > 0 seconds");
        }
        if self.delivery.max_retries > MAX_CONFIGURED_RETRIES {
            anyhow::bail!("Delivery max_retries must be <= {}", MAX_CONFIGURED_RETRIES);
        }
        if self.delivery.user_agent.trim().is_empty() {
            anyhow::bail!("Delivery user_agent must not be empty");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
