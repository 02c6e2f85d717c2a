//! Plugin configuration.
//!
//! The scheduler hands each plugin an args blob. For the Wasm plugin it
//! names where the guest module lives, an opaque configuration string the
//! guest reads back verbatim, and the guest log threshold. The blob is
//! accepted as TOML or as the JSON value the scheduler config carries.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-instance memory limit (64 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Default timeout for fetching a guest over HTTP.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("guestUrl must not be empty")]
    MissingGuestUrl,

    #[error("logSeverity {0} is out of range (0=debug .. 3=error)")]
    InvalidSeverity(i32),
}

/// Severity of a guest log record, and the threshold below which records
/// are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum LogSeverity {
    Debug = 0,
    #[default]
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogSeverity {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(LogSeverity::Debug),
            1 => Some(LogSeverity::Info),
            2 => Some(LogSeverity::Warn),
            3 => Some(LogSeverity::Error),
            _ => None,
        }
    }
}

impl TryFrom<i32> for LogSeverity {
    type Error = ConfigError;

    fn try_from(value: i32) -> Result<Self, ConfigError> {
        Self::from_i32(value).ok_or(ConfigError::InvalidSeverity(value))
    }
}

impl From<LogSeverity> for i32 {
    fn from(severity: LogSeverity) -> i32 {
        severity as i32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Location of the guest module: a path, `file://`, `http://` or `https://` URL.
    pub guest_url: String,
    /// Opaque configuration returned to the guest by `get_config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_config: Option<String>,
    #[serde(default)]
    pub log_severity: LogSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timeout_secs: Option<u64>,
}

impl PluginConfig {
    pub fn new(guest_url: &str) -> Self {
        Self {
            guest_url: guest_url.to_string(),
            guest_config: None,
            log_severity: LogSeverity::default(),
            memory_limit: None,
            fetch_timeout_secs: None,
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PluginConfig = toml::from_str(content)?;
        config.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse the plugin args object from a scheduler profile.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: PluginConfig = serde_json::from_value(value)?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.guest_url.trim().is_empty() {
            return Err(ConfigError::MissingGuestUrl);
        }
        Ok(self)
    }

    /// Builder method: set the opaque guest configuration.
    pub fn with_guest_config(self, guest_config: &str) -> Self {
        Self {
            guest_config: Some(guest_config.to_string()),
            ..self
        }
    }

    /// Builder method: set the guest log threshold.
    pub fn with_log_severity(self, log_severity: LogSeverity) -> Self {
        Self { log_severity, ..self }
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT)
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS))
    }
}
