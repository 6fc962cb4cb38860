//! In-process realtime transport.
//!
//! Every [`BroadcastEvent`] goes through one tokio broadcast channel. Each
//! connection subscribes once and keeps a [`SubscriberFilter`] describing the
//! channels it has joined; events for other channels, and events the
//! connection itself caused, are dropped on the receiving side.
//!
//! # Example
//!
//! ```rust
//! use herald_server::broadcast::{EventBroadcaster, SubscriberFilter};
//! use herald_server::types::BroadcastEvent;
//! use serde_json::json;
//!
//! let broadcaster = EventBroadcaster::new();
//! let _rx = broadcaster.subscribe();
//!
//! let event = BroadcastEvent::new("NewMessage", "chat.1", json!({"text": "hi"}));
//! assert_eq!(broadcaster.broadcast(event.clone()), 1);
//!
//! let mut filter = SubscriberFilter::for_connection(7);
//! assert!(!filter.matches(&event));
//! filter.join("chat.1");
//! assert!(filter.matches(&event));
//! assert!(!filter.matches(&event.excluding(Some(7))));
//! ```

use std::collections::HashSet;

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::types::BroadcastEvent;

/// Default channel capacity.
///
/// Subscribers that fall further behind than this get
/// `RecvError::Lagged` and miss events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Fan-out hub shared by every connection.
///
/// Cheap to clone; the sender is reference-counted.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: Sender<BroadcastEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a broadcaster with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created event broadcaster");
        Self { sender }
    }

    /// Subscribes to every event broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<BroadcastEvent> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New subscriber added"
        );
        rx
    }

    /// Emits an event. Returns how many subscribers were handed it, 0 if none.
    ///
    /// Never blocks and never fails: an event nobody listens to is dropped.
    pub fn broadcast(&self, event: BroadcastEvent) -> usize {
        trace!(
            event = %event.name,
            channel = %event.channel,
            to_others = event.origin.is_some(),
            "Broadcasting event"
        );

        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(receivers, "Event broadcast successful");
                receivers
            }
            Err(err) => {
                warn!(
                    channel = %err.0.channel,
                    event = %err.0.name,
                    "No active subscribers to receive event"
                );
                0
            }
        }
    }

    /// Returns the number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving-side filter for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    /// Connection id; events originating here are skipped.
    pub connection_id: Option<u64>,

    /// Channels the connection has joined.
    channels: HashSet<String>,
}

impl SubscriberFilter {
    /// Creates an empty filter not tied to any connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty filter for the given connection.
    #[must_use]
    pub fn for_connection(connection_id: u64) -> Self {
        Self {
            connection_id: Some(connection_id),
            channels: HashSet::new(),
        }
    }

    /// Adds a channel. Returns false if it was already joined.
    pub fn join(&mut self, channel: impl Into<String>) -> bool {
        self.channels.insert(channel.into())
    }

    /// Removes a channel. Returns false if it was not joined.
    pub fn leave(&mut self, channel: &str) -> bool {
        self.channels.remove(channel)
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Joined channels, in no particular order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    /// Returns true if the event is for a joined channel and was not caused
    /// by this connection.
    #[must_use]
    pub fn matches(&self, event: &BroadcastEvent) -> bool {
        if !self.channels.contains(&event.channel) {
            return false;
        }

        match (event.origin, self.connection_id) {
            (Some(origin), Some(own)) => origin != own,
            _ => true,
        }
    }

    /// Returns true if no channel is joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
