//! Wire types for the realtime channel.
//!
//! Every frame on the persistent connection is an [`Envelope`]
//! `{ type, data, timestamp }`. The payload types below are the `data` shapes
//! of the message kinds the engine understands; anything else is routed by
//! kind without being decoded.

use crate::error::ProtocolError;
use crate::{EntityId, Timestamp};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds known to the engine.
pub mod kinds {
    pub const AUTH: &str = "auth";
    pub const NOTIFICATION: &str = "notification";
    pub const REALTIME_UPDATE: &str = "realtime_update";
    pub const USER_STATUS: &str = "user_status";
    pub const TYPING_INDICATOR: &str = "typing_indicator";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Message envelope `{ type, data, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// The handshake frame sent immediately after the channel opens.
    pub fn auth(token: &str) -> Self {
        let data = serde_json::to_value(AuthPayload {
            token: token.to_string(),
        })
        .unwrap_or(Value::Null);
        Self::new(kinds::AUTH, data)
    }

    pub fn user_status(status: PresenceStatus) -> Self {
        let now = Utc::now();
        let data = serde_json::to_value(UserStatus {
            status,
            timestamp: now,
        })
        .unwrap_or(Value::Null);
        Self {
            kind: kinds::USER_STATUS.to_string(),
            data,
            timestamp: now,
        }
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Decode `data` into the payload type of this kind.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|e| ProtocolError::UnexpectedPayload {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// `data` of an `auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

/// Presence of an actor as broadcast to other actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// `data` of a `user_status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub status: PresenceStatus,
    pub timestamp: Timestamp,
}

// ============================================================================
// REALTIME UPDATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    StatusChanged,
    AssignmentChanged,
    ProgressUpdated,
}

/// Coarse classes the reconciler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeClass {
    EntityChanged,
    StatusChanged,
    AssignmentChanged,
}

impl RealtimeEventType {
    pub fn class(&self) -> ChangeClass {
        match self {
            RealtimeEventType::EntityCreated
            | RealtimeEventType::EntityUpdated
            | RealtimeEventType::EntityDeleted
            | RealtimeEventType::ProgressUpdated => ChangeClass::EntityChanged,
            RealtimeEventType::StatusChanged => ChangeClass::StatusChanged,
            RealtimeEventType::AssignmentChanged => ChangeClass::AssignmentChanged,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, RealtimeEventType::EntityDeleted)
    }
}

/// `data` of a `realtime_update` frame: another actor changed an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: RealtimeEventType,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub user_id: Option<EntityId>,
    #[serde(default)]
    pub project_id: Option<EntityId>,
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
}

impl RealtimeEvent {
    /// `data.status`, present on status changes.
    pub fn status(&self) -> Option<&str> {
        self.data.get("status").and_then(Value::as_str)
    }

    /// `data.assigned_to`, present on assignment changes.
    pub fn assigned_to(&self) -> Option<&str> {
        self.data.get("assigned_to").and_then(Value::as_str)
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    /// High and urgent notifications raise a user-facing alert.
    pub fn is_alerting(&self) -> bool {
        matches!(self, NotificationPriority::High | NotificationPriority::Urgent)
    }
}

/// `data` of a `notification` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: EntityId,
    #[serde(default)]
    pub user_id: Option<EntityId>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: Value,
    pub priority: NotificationPriority,
    #[serde(default)]
    pub read_at: Option<Timestamp>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}
