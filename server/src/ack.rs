//! Client whisper intake: delivery acknowledgments, typing indicators and
//! chat lines.
//!
//! Whispers are fire-and-forget. Nothing here returns an error to the
//! sender; malformed or unknown messages are logged and dropped.
//!
//! # `client-ack`
//!
//! ```json
//! {"event": "client-ack", "channel": "user.42", "sender_channel": "worker.9",
//!  "token": "...", "data": {"notification_id": "n1", "message_id": "m1", "user_id": 42}}
//! ```
//!
//! The `(user_id, notification_id)` delivery row goes from `pending` to
//! `delivered` at most once. Only the caller that made the transition
//! forwards to the system of record and tells the sender channel.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::broadcast::EventBroadcaster;
use crate::forwarder::{AckForwarder, STATUS_DELIVERED};
use crate::store::NotificationStore;
use crate::types::{loose_id, BroadcastEvent, ChatMessage, ClientMessage, PresenceProfile};

/// Prefix shared by every client-originated event.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

pub const EVENT_ACK: &str = "client-ack";
pub const EVENT_TYPING: &str = "client-typing";
pub const EVENT_MESSAGE: &str = "client-message";

/// Event name for delivery confirmations and chat lines.
pub const EVENT_NEW_MESSAGE: &str = "NewMessage";

/// Event name for typing indicators.
pub const EVENT_USER_TYPING: &str = "UserTyping";

/// Who sent a whisper.
///
/// Messages fed in without a connection (for instance through
/// [`AckProcessor::process_client_message`]) have neither field; they can
/// still acknowledge, but typing and chat whispers need a profile.
#[derive(Debug, Clone, Default)]
pub struct WhisperSender {
    pub connection_id: Option<u64>,
    pub profile: Option<PresenceProfile>,
}

/// What processing a whisper did. Used for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Not JSON, not a `client-` event, or an unhandled `client-` event.
    Ignored,

    /// The ack matched no pending delivery.
    NoOp,

    /// A delivery row moved to `delivered`.
    Delivered {
        notification_id: String,
        user_id: String,
        forwarded: bool,
    },

    /// A typing indicator or chat line was relayed.
    Relayed,
}

/// Handles whispers arriving from connected clients.
#[derive(Debug, Clone)]
pub struct AckProcessor {
    store: Arc<NotificationStore>,
    broadcaster: EventBroadcaster,
    forwarder: Option<AckForwarder>,
}

impl AckProcessor {
    pub fn new(
        store: Arc<NotificationStore>,
        broadcaster: EventBroadcaster,
        forwarder: Option<AckForwarder>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            forwarder,
        }
    }

    /// Parses and handles a raw whisper.
    pub async fn process_client_message(&self, raw: &str) -> AckOutcome {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.process(message, &WhisperSender::default()).await,
            Err(err) => {
                debug!(error = %err, "Failed to decode client message");
                AckOutcome::Ignored
            }
        }
    }

    /// Handles an already-parsed whisper from `sender`.
    pub async fn process(&self, message: ClientMessage, sender: &WhisperSender) -> AckOutcome {
        if !message.event.starts_with(CLIENT_EVENT_PREFIX) {
            debug!(event = %message.event, "Ignoring non-client event");
            return AckOutcome::Ignored;
        }

        match message.event.as_str() {
            EVENT_ACK => self.handle_ack(message, sender).await,
            EVENT_TYPING => self.handle_typing(&message, sender),
            EVENT_MESSAGE => self.handle_chat(&message, sender),
            other => {
                debug!(event = other, "Ignoring unhandled client event");
                AckOutcome::Ignored
            }
        }
    }

    async fn handle_ack(&self, message: ClientMessage, sender: &WhisperSender) -> AckOutcome {
        let field = |snake: &str, camel: &str| {
            message
                .data
                .get(snake)
                .or_else(|| message.data.get(camel))
                .and_then(loose_id)
        };

        let (Some(notification_id), Some(user_id)) = (
            field("notification_id", "notificationId"),
            field("user_id", "userId"),
        ) else {
            debug!("Acknowledgment without notification or user id");
            return AckOutcome::NoOp;
        };
        let message_id =
            field("message_id", "messageId").unwrap_or_else(|| notification_id.clone());

        debug!(
            notification_id = %notification_id,
            user_id = %user_id,
            channel = message.channel.as_deref().unwrap_or("unknown"),
            "Client acknowledgment received"
        );

        // The compare-and-set is the only gate; everything after it runs at
        // most once per delivery row.
        if self.store.mark_delivered(&user_id, &notification_id).is_none() {
            debug!(notification_id = %notification_id, "Acknowledgment matched no pending delivery");
            return AckOutcome::NoOp;
        }

        info!(
            notification_id = %notification_id,
            user_id = %user_id,
            "Notification marked as delivered"
        );

        let forwarded = match (&self.forwarder, message.token.as_deref()) {
            (Some(forwarder), Some(token)) if !token.is_empty() => {
                match forwarder.forward_delivered(token, &message_id, &user_id).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            error = %err,
                            notification_id = %notification_id,
                            "Failed to forward acknowledgment"
                        );
                        false
                    }
                }
            }
            _ => false,
        };

        match message.sender_channel.as_deref().filter(|c| !c.is_empty()) {
            Some(sender_channel) => {
                let payload = json!({
                    "messageId": message_id,
                    "status": STATUS_DELIVERED,
                    "channel": sender_channel,
                });
                self.broadcaster.broadcast(
                    BroadcastEvent::new(EVENT_NEW_MESSAGE, sender_channel, payload)
                        .excluding(sender.connection_id),
                );
            }
            None => debug!("Acknowledgment without sender channel, no confirmation sent"),
        }

        AckOutcome::Delivered {
            notification_id,
            user_id,
            forwarded,
        }
    }

    fn handle_typing(&self, message: &ClientMessage, sender: &WhisperSender) -> AckOutcome {
        let (Some(channel), Some(profile)) = (message.channel.as_deref(), &sender.profile) else {
            debug!("Typing indicator without channel or sender");
            return AckOutcome::Ignored;
        };

        let typing = message
            .data
            .get("typing")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        self.broadcaster.broadcast(
            BroadcastEvent::new(
                EVENT_USER_TYPING,
                channel,
                json!({
                    "user_id": profile.user_id,
                    "name": profile.name,
                    "typing": typing,
                }),
            )
            .excluding(sender.connection_id),
        );

        AckOutcome::Relayed
    }

    fn handle_chat(&self, message: &ClientMessage, sender: &WhisperSender) -> AckOutcome {
        let (Some(channel), Some(profile)) = (message.channel.as_deref(), &sender.profile) else {
            debug!("Chat message without channel or sender");
            return AckOutcome::Ignored;
        };

        let text = ["text", "message"]
            .iter()
            .find_map(|key| message.data.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .unwrap_or_default();

        if text.is_empty() {
            return AckOutcome::Ignored;
        }

        let line = ChatMessage {
            channel: channel.to_string(),
            user_id: profile.user_id.clone(),
            message: text.to_string(),
            sent_at: Utc::now(),
        };
        let payload = json!({
            "user_id": line.user_id,
            "name": profile.name,
            "message": line.message,
            "sent_at": line.sent_at.to_rfc3339(),
            "channel": line.channel,
        });
        self.store.append_chat(line);

        self.broadcaster.broadcast(
            BroadcastEvent::new(EVENT_NEW_MESSAGE, channel, payload)
                .excluding(sender.connection_id),
        );

        AckOutcome::Relayed
    }
}
