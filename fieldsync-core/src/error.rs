//! Error types for fieldsync operations

use crate::key::CacheKey;
use thiserror::Error;

/// Realtime transport errors. Recovered locally by reconnect backoff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Channel closed")]
    Closed,

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Transport IO error: {reason}")]
    Io { reason: String },
}

/// Malformed inbound traffic. Logged and dropped, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Unexpected payload for {kind}: {reason}")]
    UnexpectedPayload { kind: String, reason: String },
}

/// Failure of a remote request issued through the request path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request timed out")]
    Timeout,

    #[error("Request failed with status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl RequestError {
    /// Network failures, timeouts, 408 and 5xx are worth retrying for
    /// idempotent operations. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Timeout | RequestError::Network(_) => true,
            RequestError::Status { code, .. } => *code == 408 || *code >= 500,
            RequestError::Rejected(_) => false,
        }
    }
}

/// A mutation whose remote write failed. The local optimistic effect has
/// already been rolled back when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Mutation of {key} failed after {attempts} attempt(s): {source}")]
pub struct MutationError {
    pub key: CacheKey,
    pub attempts: u32,
    #[source]
    pub source: RequestError,
}

/// Local cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch for {key} failed: {reason}")]
    FetchFailed { key: CacheKey, reason: String },

    #[error("No fetcher registered for {key}")]
    NoFetcher { key: CacheKey },

    #[error("No cache entry for {key}")]
    Missing { key: CacheKey },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or FIELDSYNC_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all fieldsync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fieldsync operations.
pub type SyncResult<T> = Result<T, SyncError>;
