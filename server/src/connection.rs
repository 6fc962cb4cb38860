//! Per-connection realtime protocol.
//!
//! A [`Connection`] owns everything one client session needs: its
//! credentials, the channels it joined, and an outbound queue of
//! [`ServerFrame`]s. The WebSocket handler in [`crate::routes`] only moves
//! text between the socket and this type, so the whole protocol can be
//! driven in tests without a socket.
//!
//! # Frames
//!
//! Client to server:
//!
//! ```text
//! {"event":"subscribe","channel":"user.7"}
//! {"event":"unsubscribe","channel":"user.7"}
//! {"event":"client-ack","channel":"user.7","data":{...}}
//! {"event":"ping"}
//! ```
//!
//! Server to client: `{"event": ..., "channel": ..., "data": ...}`.
//!
//! # Ordering
//!
//! Direct replies and bus events share the outbound queue. A reply is queued
//! before anything it triggers is broadcast, so `subscription_succeeded`
//! always precedes redelivered notifications.
//!
//! The queue is bounded by [`OUTBOUND_QUEUE_CAPACITY`]. A client that stops
//! reading loses frames once it is full, the same way a lagging bus
//! receiver does, and the loss is logged.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ack::{AckProcessor, WhisperSender, CLIENT_EVENT_PREFIX};
use crate::broadcast::{EventBroadcaster, SubscriberFilter};
use crate::channel::ChannelAuthorizer;
use crate::dispatcher::NotificationDispatcher;
use crate::error::AuthError;
use crate::resolver::Credentials;
use crate::types::{BroadcastEvent, ClientMessage, PresenceProfile};

pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "subscription_succeeded";
pub const EVENT_SUBSCRIPTION_ERROR: &str = "subscription_error";
pub const EVENT_MEMBER_ADDED: &str = "member_added";
pub const EVENT_MEMBER_REMOVED: &str = "member_removed";
pub const EVENT_ERROR: &str = "error";

/// Frames buffered per connection before new ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, channel: Option<&str>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: channel.map(str::to_string),
            data,
        }
    }
}

impl From<BroadcastEvent> for ServerFrame {
    fn from(event: BroadcastEvent) -> Self {
        Self {
            event: event.name,
            channel: Some(event.channel),
            data: event.payload,
        }
    }
}

/// Who is present on which channel.
///
/// Keyed by connection so one user on two connections is listed once and
/// only leaves when the last connection does.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    channels: RwLock<HashMap<String, BTreeMap<u64, PresenceProfile>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. Returns true if its user was not present before.
    pub fn add(&self, channel: &str, connection_id: u64, profile: PresenceProfile) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let members = channels.entry(channel.to_string()).or_default();
        let first = !members.values().any(|p| p.user_id == profile.user_id);
        members.insert(connection_id, profile);
        first
    }

    /// Removes a connection. Returns its profile if that user has no other
    /// connection left on the channel.
    pub fn remove(&self, channel: &str, connection_id: u64) -> Option<PresenceProfile> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let members = channels.get_mut(channel)?;
        let profile = members.remove(&connection_id)?;
        let last = !members.values().any(|p| p.user_id == profile.user_id);
        if members.is_empty() {
            channels.remove(channel);
        }
        last.then_some(profile)
    }

    /// Distinct members of a channel, in join order of their first connection.
    pub fn members(&self, channel: &str) -> Vec<PresenceProfile> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<PresenceProfile> = Vec::new();
        if let Some(connections) = channels.get(channel) {
            for profile in connections.values() {
                if !members.iter().any(|m| m.user_id == profile.user_id) {
                    members.push(profile.clone());
                }
            }
        }
        members
    }
}

/// Shared services every connection talks to.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub authorizer: ChannelAuthorizer,
    pub dispatcher: NotificationDispatcher,
    pub processor: AckProcessor,
    pub broadcaster: EventBroadcaster,
    pub presence: Arc<PresenceRegistry>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionContext {
    pub fn new(
        authorizer: ChannelAuthorizer,
        dispatcher: NotificationDispatcher,
        processor: AckProcessor,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            authorizer,
            dispatcher,
            processor,
            broadcaster,
            presence: Arc::new(PresenceRegistry::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// State of one client session.
pub struct Connection {
    id: u64,
    credentials: Credentials,
    context: ConnectionContext,
    filter: Arc<RwLock<SubscriberFilter>>,
    /// Presence profile per joined channel.
    profiles: HashMap<String, PresenceProfile>,
    outbound: mpsc::Sender<ServerFrame>,
}

impl Connection {
    /// Opens a session. Frames for the client are pushed onto `outbound`.
    pub fn new(
        context: ConnectionContext,
        credentials: Credentials,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Self {
        let id = context.next_connection_id();
        debug!(connection_id = id, actor = %credentials.actor_type, "Connection opened");
        Self {
            id,
            credentials,
            context,
            filter: Arc::new(RwLock::new(SubscriberFilter::for_connection(id))),
            profiles: HashMap::new(),
            outbound,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.profiles.contains_key(channel)
    }

    /// Spawns the task that copies matching bus events onto the outbound queue.
    ///
    /// Subscribe before the first join so nothing broadcast after it is missed.
    pub fn spawn_event_pump(&self, mut rx: Receiver<BroadcastEvent>) -> JoinHandle<()> {
        let filter = Arc::clone(&self.filter);
        let outbound = self.outbound.clone();
        let connection_id = self.id;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let wanted = filter
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .matches(&event);
                        if !wanted {
                            continue;
                        }
                        match outbound.try_send(ServerFrame::from(event)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(frame)) => {
                                warn!(
                                    connection_id,
                                    event = %frame.event,
                                    "Outbound queue full, event dropped"
                                );
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(RecvError::Lagged(count)) => {
                        warn!(connection_id, missed = count, "Connection lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!(connection_id, "Event pump stopped");
        })
    }

    /// Handles one text frame from the client.
    pub async fn handle_text(&mut self, raw: &str) {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id = self.id, error = %err, "Unparseable client frame");
                self.send(ServerFrame::new(
                    EVENT_ERROR,
                    None,
                    json!({"message": "invalid message"}),
                ));
                return;
            }
        };

        let event = message.event.clone();
        match event.as_str() {
            EVENT_PING => self.send(ServerFrame::new(EVENT_PONG, None, Value::Null)),
            EVENT_SUBSCRIBE => match message.channel.filter(|c| !c.is_empty()) {
                Some(channel) => self.subscribe(&channel).await,
                None => self.send(ServerFrame::new(
                    EVENT_ERROR,
                    None,
                    json!({"message": "channel required"}),
                )),
            },
            EVENT_UNSUBSCRIBE => {
                if let Some(channel) = message.channel {
                    self.unsubscribe(&channel);
                }
            }
            whisper if whisper.starts_with(CLIENT_EVENT_PREFIX) => self.whisper(message).await,
            other => debug!(connection_id = self.id, event = other, "Ignoring unknown event"),
        }
    }

    async fn subscribe(&mut self, channel: &str) {
        if self.is_joined(channel) {
            let members = self.context.presence.members(channel);
            self.send(ServerFrame::new(
                EVENT_SUBSCRIPTION_SUCCEEDED,
                Some(channel),
                json!({"members": members}),
            ));
            return;
        }

        let (identity, profile) = match self.context.authorizer.join(&self.credentials, channel).await
        {
            Ok(joined) => joined,
            Err(err) => {
                let code = match err {
                    AuthError::Unauthenticated(_) => 401,
                    AuthError::Denied(_) => 403,
                };
                info!(connection_id = self.id, channel, code, "Subscription rejected");
                self.send(ServerFrame::new(
                    EVENT_SUBSCRIPTION_ERROR,
                    Some(channel),
                    json!({"code": code}),
                ));
                return;
            }
        };

        self.filter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .join(channel);
        let first = self
            .context
            .presence
            .add(channel, self.id, profile.clone());
        self.profiles.insert(channel.to_string(), profile.clone());

        let members = self.context.presence.members(channel);
        self.send(ServerFrame::new(
            EVENT_SUBSCRIPTION_SUCCEEDED,
            Some(channel),
            json!({"members": members}),
        ));

        if first {
            self.context.broadcaster.broadcast(
                BroadcastEvent::new(EVENT_MEMBER_ADDED, channel, json!(profile))
                    .excluding(Some(self.id)),
            );
        }

        info!(
            connection_id = self.id,
            channel,
            user_id = %identity.external_user_id,
            "Channel joined"
        );

        self.context
            .dispatcher
            .redeliver_pending_on(&identity.external_user_id, channel);
    }

    fn unsubscribe(&mut self, channel: &str) {
        if self.profiles.remove(channel).is_none() {
            return;
        }

        self.filter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .leave(channel);

        if let Some(profile) = self.context.presence.remove(channel, self.id) {
            self.context.broadcaster.broadcast(
                BroadcastEvent::new(EVENT_MEMBER_REMOVED, channel, json!(profile))
                    .excluding(Some(self.id)),
            );
        }

        debug!(connection_id = self.id, channel, "Channel left");
    }

    async fn whisper(&mut self, mut message: ClientMessage) {
        let Some(channel) = message.channel.clone().filter(|c| self.is_joined(c)) else {
            debug!(
                connection_id = self.id,
                event = %message.event,
                "Whisper on a channel the connection has not joined"
            );
            return;
        };

        self.context.broadcaster.broadcast(
            BroadcastEvent::new(message.event.clone(), channel.clone(), message.data.clone())
                .excluding(Some(self.id)),
        );

        if message.sender_channel.as_deref().map_or(true, str::is_empty) {
            message.sender_channel = Some(channel.clone());
        }
        message.token = self.credentials.token.clone();

        let sender = WhisperSender {
            connection_id: Some(self.id),
            profile: self.profiles.get(&channel).cloned(),
        };
        self.context.processor.process(message, &sender).await;
    }

    /// Leaves every joined channel. Call once the socket is gone.
    pub fn close(&mut self) {
        let channels: Vec<String> = self.profiles.keys().cloned().collect();
        for channel in channels {
            self.unsubscribe(&channel);
        }
        debug!(connection_id = self.id, "Connection closed");
    }

    fn send(&self, frame: ServerFrame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!(
                    connection_id = self.id,
                    event = %frame.event,
                    "Outbound queue full, reply dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                trace!(connection_id = self.id, "Outbound queue closed");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("credentials", &self.credentials)
            .field("channels", &self.profiles.keys().collect::<Vec<_>>())
            .finish()
    }
}
