//! Server configuration
//!
//! All settings the core reads, loaded from an optional TOML file with
//! serde-supplied defaults. Unknown keys are rejected so typos surface at
//! startup rather than silently falling back to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub message_queue: MessageQueueSettings,
    pub auth: AuthSettings,
    pub processor: ProcessorSettings,
}

impl AppConfig {
    /// Loads configuration from `path`, or returns defaults when no path is
    /// given.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerSettings {
    /// Socket address the server binds to
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseSettings {
    /// Path of the SQLite database file
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "fleetd.db".to_string(),
        }
    }
}

/// Durable queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MessageQueueSettings {
    /// PENDING/IN_PROGRESS rows older than this are marked EXPIRED
    pub expiration_timeout_minutes: u64,
    /// COMPLETED rows older than this many days are deleted by maintenance
    pub cleanup_after_days: u64,
}

impl Default for MessageQueueSettings {
    fn default() -> Self {
        Self {
            expiration_timeout_minutes: 60,
            cleanup_after_days: 7,
        }
    }
}

/// Agent authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthSettings {
    /// Lifetime of an issued connection token
    pub connection_token_ttl_seconds: u64,
    /// Sliding window for the per-source-IP rate limit
    pub rate_limit_window_seconds: u64,
    /// Auth attempts allowed per source IP inside the window
    pub rate_limit_max_attempts: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            connection_token_ttl_seconds: 3600,
            rate_limit_window_seconds: 900,
            rate_limit_max_attempts: 10,
        }
    }
}

/// Inbound processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProcessorSettings {
    /// IN_PROGRESS rows older than this are reset to PENDING
    pub stuck_in_progress_seconds: u64,
    /// Distinct hosts (and messages per host) handled per tick
    pub host_batch_size: u32,
    /// Interval between processor ticks
    pub poll_interval_seconds: u64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            stuck_in_progress_seconds: 30,
            host_batch_size: 10,
            poll_interval_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.message_queue.expiration_timeout_minutes, 60);
        assert_eq!(config.auth.connection_token_ttl_seconds, 3600);
        assert_eq!(config.auth.rate_limit_window_seconds, 900);
        assert_eq!(config.processor.stuck_in_progress_seconds, 30);
        assert_eq!(config.processor.host_batch_size, 10);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [processor]
            host_batch_size = 25
            "#,
        )
        .unwrap();
        assert_eq!(parsed.processor.host_batch_size, 25);
        assert_eq!(parsed.processor.stuck_in_progress_seconds, 30);
        assert_eq!(parsed.message_queue.expiration_timeout_minutes, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed = toml::from_str::<AppConfig>("[processor]\nhost_batch_sizes = 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_path_yields_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
    }
}
