//! Notification and delivery storage.
//!
//! Holds immutable [`Notification`]s, their per-recipient [`DeliveryRecord`]s
//! and the best-effort chat log. All tables sit behind one [`RwLock`], which
//! is what makes [`NotificationStore::mark_delivered`] a compare-and-set:
//! the status is read and written under the same write guard.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{ChatMessage, DeliveryRecord, DeliveryStatus, Notification};

/// Maximum number of stored notifications.
const DEFAULT_MAX_NOTIFICATIONS: usize = 1_000_000;

/// Maximum number of chat lines kept; older lines are dropped first.
const DEFAULT_MAX_CHAT_MESSAGES: usize = 10_000;

/// Errors that can occur when writing to the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is full.
    #[error("notification store at maximum capacity ({max_capacity} notifications)")]
    AtCapacity {
        /// The maximum number of notifications allowed.
        max_capacity: usize,
    },

    /// A row with the same key already exists.
    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// Configuration for the notification store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_notifications: usize,
    pub max_chat_messages: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
            max_chat_messages: DEFAULT_MAX_CHAT_MESSAGES,
        }
    }
}

type DeliveryKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    notifications: HashMap<String, Notification>,
    /// Notification ids, oldest first.
    order: VecDeque<String>,
    /// notification_id -> recipients.
    recipients: HashMap<String, Vec<String>>,
    /// (user_id, notification_id) -> row.
    deliveries: HashMap<DeliveryKey, DeliveryRecord>,
    /// user_id -> notification ids, in insertion order.
    by_user: HashMap<String, Vec<String>>,
    chat: VecDeque<ChatMessage>,
}

impl Tables {
    /// True once no recipient of `notification_id` is still pending.
    fn is_settled(&self, notification_id: &str) -> bool {
        self.recipients
            .get(notification_id)
            .map_or(true, |users| {
                users.iter().all(|user_id| {
                    self.deliveries
                        .get(&(user_id.clone(), notification_id.to_string()))
                        .map_or(true, |row| row.status != DeliveryStatus::Pending)
                })
            })
    }

    /// Drops every settled notification with its delivery rows. Returns how
    /// many notifications were removed.
    fn evict_settled(&mut self) -> usize {
        let settled: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.is_settled(id))
            .cloned()
            .collect();

        for id in &settled {
            self.notifications.remove(id);
            for user_id in self.recipients.remove(id).unwrap_or_default() {
                self.deliveries.remove(&(user_id.clone(), id.clone()));
                if let Some(ids) = self.by_user.get_mut(&user_id) {
                    ids.retain(|n| n != id);
                    if ids.is_empty() {
                        self.by_user.remove(&user_id);
                    }
                }
            }
        }

        if !settled.is_empty() {
            let notifications = &self.notifications;
            self.order.retain(|id| notifications.contains_key(id));
        }

        settled.len()
    }
}

/// Thread-safe in-memory notification store.
pub struct NotificationStore {
    tables: RwLock<Tables>,
    config: StoreConfig,
}

impl NotificationStore {
    pub fn new(config: StoreConfig) -> Self {
        debug!(
            max_notifications = config.max_notifications,
            "Creating new notification store"
        );
        Self {
            tables: RwLock::new(Tables::default()),
            config,
        }
    }

    /// Writes a notification and one pending delivery row per recipient.
    ///
    /// Either everything is written or nothing is.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AtCapacity`] - the store is full even after dropping
    ///   settled notifications (no recipient still pending)
    /// - [`StoreError::Duplicate`] - the notification id exists, or a
    ///   recipient appears twice
    pub fn record_dispatch(
        &self,
        notification: Notification,
        recipients: &[String],
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        if tables.notifications.len() >= self.config.max_notifications {
            let evicted = tables.evict_settled();
            if tables.notifications.len() >= self.config.max_notifications {
                warn!(
                    max_capacity = self.config.max_notifications,
                    "Notification store at capacity"
                );
                return Err(StoreError::AtCapacity {
                    max_capacity: self.config.max_notifications,
                });
            }
            debug!(evicted, "Evicted settled notifications to make room");
        }

        if tables.notifications.contains_key(&notification.id) {
            return Err(StoreError::Duplicate(format!(
                "notification {}",
                notification.id
            )));
        }

        let mut rows = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            let key = (user_id.clone(), notification.id.clone());
            let repeated = rows.iter().any(|r: &DeliveryRecord| &r.user_id == user_id);
            if repeated || tables.deliveries.contains_key(&key) {
                return Err(StoreError::Duplicate(format!(
                    "delivery for user {user_id} of notification {}",
                    notification.id
                )));
            }
            rows.push(DeliveryRecord::pending(user_id.clone(), notification.id.clone()));
        }

        for row in &rows {
            tables
                .by_user
                .entry(row.user_id.clone())
                .or_default()
                .push(row.notification_id.clone());
            tables.deliveries.insert(
                (row.user_id.clone(), row.notification_id.clone()),
                row.clone(),
            );
        }

        trace!(
            notification_id = %notification.id,
            recipients = rows.len(),
            "Stored notification"
        );
        tables.order.push_back(notification.id.clone());
        tables
            .recipients
            .insert(notification.id.clone(), recipients.to_vec());
        tables
            .notifications
            .insert(notification.id.clone(), notification);

        Ok(rows)
    }

    /// Transitions a delivery from `pending` to `delivered`.
    ///
    /// Returns the updated row if this call made the transition, `None` if the
    /// row does not exist or was not pending. Concurrent callers for the same
    /// row see exactly one `Some`.
    pub fn mark_delivered(&self, user_id: &str, notification_id: &str) -> Option<DeliveryRecord> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        let key = (user_id.to_string(), notification_id.to_string());
        let row = tables.deliveries.get_mut(&key)?;

        if row.status != DeliveryStatus::Pending {
            trace!(notification_id, status = ?row.status, "Delivery not pending");
            return None;
        }

        row.status = DeliveryStatus::Delivered;
        row.delivered_at = Some(Utc::now());
        Some(row.clone())
    }

    pub fn get_delivery(&self, user_id: &str, notification_id: &str) -> Option<DeliveryRecord> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .deliveries
            .get(&(user_id.to_string(), notification_id.to_string()))
            .cloned()
    }

    pub fn get_notification(&self, id: &str) -> Option<Notification> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.notifications.get(id).cloned()
    }

    /// Notifications still pending for `user_id`, oldest first.
    pub fn pending_for(&self, user_id: &str) -> Vec<Notification> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);

        let Some(ids) = tables.by_user.get(user_id) else {
            return Vec::new();
        };

        ids.iter()
            .filter(|id| {
                tables
                    .deliveries
                    .get(&(user_id.to_string(), (*id).clone()))
                    .is_some_and(|row| row.status == DeliveryStatus::Pending)
            })
            .filter_map(|id| tables.notifications.get(id).cloned())
            .collect()
    }

    /// Appends a chat line, dropping the oldest one when full.
    pub fn append_chat(&self, message: ChatMessage) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if self.config.max_chat_messages == 0 {
            return;
        }
        while tables.chat.len() >= self.config.max_chat_messages {
            tables.chat.pop_front();
        }
        tables.chat.push_back(message);
    }

    #[cfg(test)]
    pub(crate) fn chat_lines(&self, channel: &str) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .chat
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.message.clone())
            .collect()
    }

    pub fn notification_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .len()
    }

    pub fn delivery_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deliveries
            .len()
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for NotificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStore")
            .field("notification_count", &self.notification_count())
            .field("delivery_count", &self.delivery_count())
            .field("config", &self.config)
            .finish()
    }
}
