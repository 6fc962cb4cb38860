//! Notification fan-out.
//!
//! A dispatch validates the request, works out the recipients, persists one
//! [`Notification`] plus a pending [`DeliveryRecord`](crate::types::DeliveryRecord)
//! per recipient, and only then emits the event on the channel. A failed
//! write aborts the dispatch before anything is emitted; an emission nobody
//! hears is not a failure.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::EventBroadcaster;
use crate::channel::ChannelScope;
use crate::error::DispatchError;
use crate::store::NotificationStore;
use crate::types::{loose_id, BroadcastEvent, Notification};

/// Title used when a dispatch does not carry one.
pub const DEFAULT_TITLE: &str = "Notification";

/// Explicit recipients: a JSON array of ids or one comma-separated string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UserIds {
    List(Vec<Value>),
    Joined(String),
}

impl Default for UserIds {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl UserIds {
    /// Trimmed, non-empty ids in the order given.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::List(values) => values.iter().filter_map(loose_id).collect(),
            Self::Joined(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl From<Vec<String>> for UserIds {
    fn from(ids: Vec<String>) -> Self {
        Self::List(ids.into_iter().map(Value::String).collect())
    }
}

/// A broadcast trigger.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub channel: String,

    #[serde(default)]
    pub event: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(
        default,
        rename = "userIds",
        alias = "user_ids",
        deserialize_with = "deserialize_user_ids"
    )]
    pub user_ids: UserIds,
}

fn deserialize_user_ids<'de, D>(deserializer: D) -> Result<UserIds, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<UserIds>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub notification: Notification,
    pub recipients: Vec<String>,
    /// Subscribers the event was handed to. Zero is not an error.
    pub receivers: usize,
}

/// Returns the id implied by a `user.<id>` or `worker.<id>` channel.
///
/// `<id>` must consist of ASCII letters, digits and underscores only.
pub fn implied_recipient(channel: &str) -> Option<&str> {
    if ChannelScope::parse(channel) == ChannelScope::Open {
        return None;
    }
    let (_, id) = channel.split_once('.')?;
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        .then_some(id)
}

/// Explicit ids plus the channel-implied id, deduplicated in first-seen order.
pub fn resolve_recipients(channel: &str, explicit: &UserIds) -> Vec<String> {
    let mut seen = HashSet::new();
    explicit
        .to_vec()
        .into_iter()
        .chain(implied_recipient(channel).map(str::to_string))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Builds the wire payload for a notification.
pub fn notification_payload(notification: &Notification) -> Value {
    let lift = |key: &str| notification.data.get(key).cloned().unwrap_or(Value::Null);

    json!({
        "id": notification.id,
        "title": notification.title.as_deref().unwrap_or(DEFAULT_TITLE),
        "message": lift("message"),
        "event_type": notification.event,
        "notification_type": lift("notification_type"),
        "channel": notification.channel,
        "timestamp": notification.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "data": notification.data,
        "metaData": lift("metaData"),
    })
}

fn notification_event(notification: &Notification) -> BroadcastEvent {
    BroadcastEvent::new(
        notification.event.clone(),
        notification.channel.clone(),
        notification_payload(notification),
    )
}

/// Persists notifications and emits them.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    store: Arc<NotificationStore>,
    broadcaster: EventBroadcaster,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<NotificationStore>, broadcaster: EventBroadcaster) -> Self {
        Self { store, broadcaster }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    /// Validates, persists and emits a notification.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidRequest`] - `data`, `channel` or `event` is
    ///   missing or empty; nothing was written
    /// - [`DispatchError::Persistence`] - a write failed; nothing was emitted
    pub fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        let channel = request.channel.trim();
        let event = request.event.trim();

        if is_blank(&request.data) || channel.is_empty() || event.is_empty() {
            debug!(
                has_data = !is_blank(&request.data),
                has_channel = !channel.is_empty(),
                has_event = !event.is_empty(),
                "Rejected dispatch request"
            );
            return Err(DispatchError::invalid("Data, channel, and event required"));
        }

        let recipients = resolve_recipients(channel, &request.user_ids);

        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            event: event.to_string(),
            title: request.title.filter(|t| !t.trim().is_empty()),
            data: request.data,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.record_dispatch(notification.clone(), &recipients) {
            warn!(error = %err, channel, event, "Failed to persist notification");
            return Err(err.into());
        }

        let receivers = self.broadcaster.broadcast(notification_event(&notification));

        info!(
            notification_id = %notification.id,
            channel,
            event,
            recipients = recipients.len(),
            receivers,
            "Notification dispatched"
        );

        Ok(DispatchOutcome {
            notification,
            recipients,
            receivers,
        })
    }

    /// Re-emits every notification still pending for `user_id`.
    ///
    /// Returns how many were emitted. Delivery status is untouched.
    pub fn redeliver_pending(&self, user_id: &str) -> usize {
        self.redeliver(user_id, self.store.pending_for(user_id))
    }

    /// Re-emits the notifications still pending for `user_id` that were
    /// addressed to `channel`. Run after each join, so a client joining
    /// several channels gets each notification once.
    pub fn redeliver_pending_on(&self, user_id: &str, channel: &str) -> usize {
        let mut pending = self.store.pending_for(user_id);
        pending.retain(|n| n.channel == channel);
        self.redeliver(user_id, pending)
    }

    fn redeliver(&self, user_id: &str, pending: Vec<Notification>) -> usize {
        for notification in &pending {
            self.broadcaster.broadcast(notification_event(notification));
        }

        if !pending.is_empty() {
            info!(user_id, count = pending.len(), "Redelivered pending notifications");
        }

        pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreConfig, StoreError};
    use crate::types::DeliveryStatus;

    fn dispatcher() -> (NotificationDispatcher, EventBroadcaster) {
        let broadcaster = EventBroadcaster::new();
        let dispatcher =
            NotificationDispatcher::new(Arc::new(NotificationStore::default()), broadcaster.clone());
        (dispatcher, broadcaster)
    }

    fn request(channel: &str, user_ids: UserIds) -> DispatchRequest {
        DispatchRequest {
            channel: channel.to_string(),
            event: "order.created".to_string(),
            data: json!({"message": "Your order shipped", "notification_type": "order"}),
            title: None,
            user_ids,
        }
    }

    #[test]
    fn implied_recipient_requires_word_id() {
        assert_eq!(implied_recipient("user.42"), Some("42"));
        assert_eq!(implied_recipient("worker.w_9"), Some("w_9"));
        assert_eq!(implied_recipient("user.42.inbox"), None);
        assert_eq!(implied_recipient("user.a-b"), None);
        assert_eq!(implied_recipient("user."), None);
        assert_eq!(implied_recipient("chat.42"), None);
    }

    #[test]
    fn recipients_deduplicate_channel_and_explicit_ids() {
        let ids = UserIds::from(vec!["42".to_string()]);
        assert_eq!(resolve_recipients("user.42", &ids), vec!["42"]);

        let ids = UserIds::from(vec!["7".to_string(), "8".to_string(), "7".to_string()]);
        assert_eq!(resolve_recipients("user.42", &ids), vec!["7", "8", "42"]);
    }

    #[test]
    fn user_ids_accept_comma_string_and_numbers() {
        let ids: UserIds = serde_json::from_value(json!(" 1, 2 ,,3 ")).unwrap();
        assert_eq!(ids.to_vec(), vec!["1", "2", "3"]);

        let ids: UserIds = serde_json::from_value(json!([1, "2", "", null])).unwrap();
        assert_eq!(ids.to_vec(), vec!["1", "2"]);
    }

    #[test]
    fn dispatch_request_deserializes_camel_case_user_ids() {
        let req: DispatchRequest = serde_json::from_value(json!({
            "channel": "lobby",
            "event": "e",
            "data": {"x": 1},
            "userIds": "5,6"
        }))
        .unwrap();
        assert_eq!(req.user_ids.to_vec(), vec!["5", "6"]);

        let req: DispatchRequest =
            serde_json::from_value(json!({"channel": "c", "userIds": null})).unwrap();
        assert!(req.user_ids.to_vec().is_empty());
    }

    #[test]
    fn dispatch_rejects_empty_fields_without_side_effects() {
        let (dispatcher, _) = dispatcher();

        for data in [json!(null), json!({}), json!([]), json!("")] {
            let req = DispatchRequest {
                data,
                ..request("user.42", UserIds::default())
            };
            let err = dispatcher.dispatch(req).unwrap_err();
            assert!(matches!(err, DispatchError::InvalidRequest(_)));
        }

        let err = dispatcher
            .dispatch(request("  ", UserIds::default()))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));

        let req = DispatchRequest {
            event: String::new(),
            ..request("user.42", UserIds::default())
        };
        assert!(dispatcher.dispatch(req).is_err());

        assert_eq!(dispatcher.store().notification_count(), 0);
        assert_eq!(dispatcher.store().delivery_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_persists_then_emits() {
        let (dispatcher, broadcaster) = dispatcher();
        let mut rx = broadcaster.subscribe();

        let outcome = dispatcher
            .dispatch(request("user.42", UserIds::from(vec!["42".to_string()])))
            .unwrap();

        assert_eq!(outcome.recipients, vec!["42"]);
        assert_eq!(outcome.receivers, 1);

        let row = dispatcher
            .store()
            .get_delivery("42", &outcome.notification.id)
            .unwrap();
        assert_eq!(row.status, DeliveryStatus::Pending);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "order.created");
        assert_eq!(event.channel, "user.42");
        assert_eq!(event.origin, None);
        assert_eq!(event.payload["id"], json!(outcome.notification.id));
        assert_eq!(event.payload["title"], json!("Notification"));
        assert_eq!(event.payload["message"], json!("Your order shipped"));
        assert_eq!(event.payload["notification_type"], json!("order"));
        assert_eq!(event.payload["event_type"], json!("order.created"));
        assert_eq!(event.payload["metaData"], Value::Null);
    }

    #[test]
    fn dispatch_without_subscribers_still_succeeds() {
        let (dispatcher, _) = dispatcher();
        let outcome = dispatcher
            .dispatch(request("lobby", UserIds::default()))
            .unwrap();

        assert_eq!(outcome.receivers, 0);
        assert!(outcome.recipients.is_empty());
        assert_eq!(dispatcher.store().notification_count(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_aborts_before_emission() {
        let broadcaster = EventBroadcaster::new();
        let store = Arc::new(NotificationStore::new(StoreConfig {
            max_notifications: 0,
            ..StoreConfig::default()
        }));
        let dispatcher = NotificationDispatcher::new(store, broadcaster.clone());
        let mut rx = broadcaster.subscribe();

        let err = dispatcher
            .dispatch(request("user.42", UserIds::default()))
            .unwrap_err();

        assert_eq!(
            err,
            DispatchError::Persistence(StoreError::AtCapacity { max_capacity: 0 })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn explicit_title_is_kept() {
        let notification = Notification {
            id: "n1".to_string(),
            channel: "lobby".to_string(),
            event: "e".to_string(),
            title: Some("Shipped".to_string()),
            data: json!({"metaData": {"order": 9}}),
            created_at: Utc::now(),
        };
        let payload = notification_payload(&notification);
        assert_eq!(payload["title"], json!("Shipped"));
        assert_eq!(payload["metaData"], json!({"order": 9}));
        assert_eq!(payload["message"], Value::Null);
    }

    #[tokio::test]
    async fn redeliver_pending_reemits_without_changing_status() {
        let (dispatcher, broadcaster) = dispatcher();
        let first = dispatcher
            .dispatch(request("user.42", UserIds::default()))
            .unwrap();
        let second = dispatcher
            .dispatch(request("user.42", UserIds::default()))
            .unwrap();
        dispatcher
            .store()
            .mark_delivered("42", &second.notification.id);

        let mut rx = broadcaster.subscribe();
        assert_eq!(dispatcher.redeliver_pending("42"), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["id"], json!(first.notification.id));
        assert_eq!(
            dispatcher
                .store()
                .get_delivery("42", &first.notification.id)
                .unwrap()
                .status,
            DeliveryStatus::Pending
        );
        assert_eq!(dispatcher.redeliver_pending("nobody"), 0);
    }

    #[tokio::test]
    async fn redeliver_pending_on_filters_by_channel() {
        let (dispatcher, broadcaster) = dispatcher();
        let direct = dispatcher
            .dispatch(request("user.42", UserIds::default()))
            .unwrap();
        dispatcher
            .dispatch(request("lobby", UserIds::from(vec!["42".to_string()])))
            .unwrap();

        let mut rx = broadcaster.subscribe();
        assert_eq!(dispatcher.redeliver_pending_on("42", "user.42"), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["id"], json!(direct.notification.id));

        assert_eq!(dispatcher.redeliver_pending_on("42", "lobby"), 1);
        assert_eq!(dispatcher.redeliver_pending_on("42", "chat.1"), 0);
    }
}
