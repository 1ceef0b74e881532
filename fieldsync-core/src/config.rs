//! Configuration loading for the sync engine.
//!
//! The endpoint and the reconnection limits are supplied externally; the
//! defaults match the limits the field clients have always shipped with.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_ENV: &str = "FIELDSYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Base URL of the realtime endpoint; the actor id is appended as
    /// `/ws/<actor>`.
    pub ws_base_url: String,
    /// Capacity of the outbound frame buffer per connection.
    pub outbound_buffer: usize,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
    pub retry: RetryConfig,
}

/// Transport Session reconnection after an unexpected close.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    /// 1.0 gives a fixed interval.
    pub multiplier: f64,
    pub jitter_ms: u64,
}

/// Presence-driven reconnection: `min(2^attempt * base_ms, cap_ms)`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

/// Retries of mutations declared idempotent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8080".to_string(),
            outbound_buffer: 256,
            reconnect: ReconnectConfig::default(),
            presence: PresenceConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_ms: 3_000,
            max_ms: 3_000,
            multiplier: 1.0,
            jitter_ms: 0,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 32_000,
            max_attempts: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Load from `--config <path>` or `FIELDSYNC_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.ws_base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ws_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                field: "ws_base_url",
                reason: "must use ws:// or wss://".to_string(),
            });
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "outbound_buffer",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.presence.base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "presence.base_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.presence.cap_ms < self.presence.base_ms {
            return Err(ConfigError::InvalidValue {
                field: "presence.cap_ms",
                reason: "must be >= base_ms".to_string(),
            });
        }
        if self.presence.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "presence.max_attempts",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retry.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.retry.max_ms < self.retry.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Endpoint for one actor's channel.
    pub fn endpoint_for(&self, actor: &crate::ActorId) -> String {
        format!("{}/ws/{}", self.ws_base_url.trim_end_matches('/'), actor)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
