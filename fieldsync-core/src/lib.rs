//! Fieldsync Core - shared types
//!
//! Keys, wire payloads, errors and configuration shared by the cache,
//! realtime and engine crates. This crate holds data types only; behaviour
//! lives in the crates that own each component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod key;
pub mod wire;

pub use config::{EngineConfig, PresenceConfig, ReconnectConfig, RetryConfig};
pub use error::{
    CacheError, ConfigError, MutationError, ProtocolError, RequestError, SyncError, SyncResult,
    TransportError,
};
pub use key::{CacheKey, KeyPrefix};
pub use wire::{
    kinds, AuthPayload, ChangeClass, Envelope, Notification, NotificationPriority, PresenceStatus,
    RealtimeEvent, RealtimeEventType, UserStatus,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of business entities as carried on the wire (`"M1"`, a UUID, ...).
pub type EntityId = String;

/// Identity of the signed-in actor. One transport session exists per actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh timestamp-sortable actor id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for ActorId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
