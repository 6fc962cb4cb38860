//! Shared data model for the Herald gateway.
//!
//! These types cross module boundaries: identity rows owned by the identity
//! cache, notifications and their per-recipient delivery rows, the public
//! presence profile, and the JSON shapes that travel over the realtime
//! transport.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Fallback display name exposed in presence data when none is known.
pub const DEFAULT_DISPLAY_NAME: &str = "User";

/// Coarse principal class used to segregate channel namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Worker,
}

impl ActorType {
    /// Wire representation, as sent in the `x-actor-type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Worker => "worker",
        }
    }
}

impl Default for ActorType {
    fn default() -> Self {
        Self::User
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an actor type string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown actor type: {0}")]
pub struct UnknownActorType(pub String);

impl FromStr for ActorType {
    type Err = UnknownActorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "worker" => Ok(Self::Worker),
            other => Err(UnknownActorType(other.to_string())),
        }
    }
}

/// A resolved principal, cached in front of the external authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Store-assigned row id. Zero until the record has been stored.
    pub id: u64,

    /// Provider-assigned user id. Not unique across actor types.
    pub external_user_id: String,

    /// Scopes the token to one logical connection.
    pub session_id: String,

    /// Opaque credential.
    pub token: String,

    pub actor_type: ActorType,

    pub display_name: Option<String>,

    pub expires_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// Returns true if the record is still valid at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// The only identity data ever shown to other channel members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceProfile {
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub actor_type: ActorType,
}

impl From<&IdentityRecord> for PresenceProfile {
    fn from(identity: &IdentityRecord) -> Self {
        Self {
            user_id: identity.external_user_id.clone(),
            name: identity
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            actor_type: identity.actor_type,
        }
    }
}

/// A broadcast intent. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub channel: String,
    pub event: String,
    pub title: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a per-recipient delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    /// Reserved; nothing transitions into it yet.
    Read,
}

/// Per-recipient fan-out row of a [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub user_id: String,
    pub notification_id: String,
    pub status: DeliveryStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Creates a new pending delivery row.
    pub fn pending(user_id: impl Into<String>, notification_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            notification_id: notification_id.into(),
            status: DeliveryStatus::Pending,
            delivered_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Chat line sent over a `client-message` whisper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: String,
    pub user_id: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Structured event emitted to the members of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEvent {
    /// Wire event name.
    pub name: String,
    pub channel: String,
    pub payload: Value,

    /// Connection that caused the event; it is skipped on delivery.
    #[serde(skip)]
    pub origin: Option<u64>,
}

impl BroadcastEvent {
    pub fn new(name: impl Into<String>, channel: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            payload,
            origin: None,
        }
    }

    /// Marks the event as "to others": the originating connection won't see it.
    #[must_use]
    pub fn excluding(mut self, origin: Option<u64>) -> Self {
        self.origin = origin;
        self
    }
}

/// Message arriving from a client over the realtime transport.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub event: String,

    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub sender_channel: Option<String>,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub token: Option<String>,
}

/// Deserializes an id that upstream systems may send as a string or a number.
pub fn deserialize_loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| loose_id(&v)))
}

/// Returns a non-empty string form of a JSON string or number.
pub fn loose_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
