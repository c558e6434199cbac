//! Bus and channel configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file or string
//! - Environment variables (`IMPULSE_*`) for the defaults

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The TOML could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// What a channel does with a message when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new message.
    #[default]
    Reject,
    /// Evict the oldest pending message to make room.
    DropOldest,
}

/// Per-channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum number of undelivered messages.
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,

    /// Policy applied when the message queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Upper bound for a single listener invocation, in milliseconds.
    #[serde(default = "default_listener_timeout")]
    pub listener_timeout_ms: Option<u64>,

    /// Create channels on hold instead of open.
    #[serde(default)]
    pub start_on_hold: bool,
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Defaults for channels created by the registry.
    #[serde(default)]
    pub channel: ChannelConfig,
}

// Default value functions
fn default_max_pending_messages() -> usize {
    std::env::var("IMPULSE_MAX_PENDING_MESSAGES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10_000)
}

fn default_listener_timeout() -> Option<u64> {
    Some(30_000)
}

fn default_max_channels() -> usize {
    10_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: default_max_pending_messages(),
            overflow: OverflowPolicy::default(),
            listener_timeout_ms: default_listener_timeout(),
            start_on_hold: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            channel: ChannelConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Listener time limit, if any.
    #[must_use]
    pub fn listener_timeout(&self) -> Option<Duration> {
        self.listener_timeout_ms.map(Duration::from_millis)
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending_messages == 0 {
            return Err(ConfigError::Invalid("max_pending_messages must be positive"));
        }
        if self.listener_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("listener_timeout_ms must be positive"));
        }
        Ok(())
    }
}

impl BusConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or a value is invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_channels == 0 {
            return Err(ConfigError::Invalid("max_channels must be positive"));
        }
        self.channel.validate()
    }
}
