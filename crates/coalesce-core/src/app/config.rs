//! SchedulerConfig - スケジューラ設定
//!
//! serde の default 関数で既定値を与え、TOML から部分的に上書きできる。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store key used when none is configured.
pub const DEFAULT_TOKEN: &str = "schedule@formIdCollector";

/// Upper bound for any configured duration (about 292 thousand years).
const MAX_DURATION_MS: i64 = i64::MAX / 1_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Store key of the queue record.
    #[serde(default = "default_token")]
    pub token: String,

    /// Milliseconds between successful drains (and between empty polls).
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Milliseconds before an in-flight report is cancelled.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Milliseconds before retrying after a failed report.
    #[serde(default = "default_retry_time_ms")]
    pub retry_time_ms: u64,
}

fn default_token() -> String {
    DEFAULT_TOKEN.to_string()
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retry_time_ms() -> u64 {
    3_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            retry_time_ms: default_retry_time_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_retry_time_ms(mut self, ms: u64) -> Self {
        self.retry_time_ms = ms;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_time(&self) -> Duration {
        Duration::from_millis(self.retry_time_ms)
    }

    /// Longest a healthy drain can keep the lock past its fire time.
    pub fn max_spend_ms(&self) -> i64 {
        let max = self
            .interval_ms
            .max(self.timeout_ms)
            .max(self.retry_time_ms);
        i64::try_from(max).unwrap_or(i64::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("token must not be empty".into()));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be > 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be > 0".into()));
        }
        if self.retry_time_ms == 0 {
            return Err(ConfigError::Invalid("retry_time_ms must be > 0".into()));
        }
        // fire times are i64 epoch millis; now + duration must not overflow
        if self.max_spend_ms() > MAX_DURATION_MS {
            return Err(ConfigError::Invalid("durations are out of range".into()));
        }
        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
