//! Client for the downstream system of record.
//!
//! When a delivery is acknowledged, the system that owns the message is told
//! about it:
//!
//! ```text
//! POST {base_url}/api/admin/messages/ack
//! Authorization: Bearer <client token>
//!
//! {"messageId": "...", "recipientId": "...", "newStatus": "DELIVERED"}
//! ```
//!
//! Forwarding is best-effort. Callers log failures and carry on; nothing is
//! retried.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Path appended to the configured base URL.
pub const ACK_PATH: &str = "/api/admin/messages/ack";

/// Status reported for a delivery acknowledgment.
pub const STATUS_DELIVERED: &str = "DELIVERED";

/// Errors that can occur when forwarding an acknowledgment.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The system of record could not be reached.
    #[error("system of record unavailable: {0}")]
    Unavailable(String),

    /// The system of record answered with a non-success status.
    #[error("system of record rejected acknowledgment with status {0}")]
    Rejected(u16),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckBody<'a> {
    message_id: &'a str,
    recipient_id: &'a str,
    new_status: &'a str,
}

/// HTTP client for the system of record.
///
/// Cheap to clone; the inner `reqwest::Client` is reference-counted.
#[derive(Debug, Clone)]
pub struct AckForwarder {
    http_client: Client,
    ack_url: String,
    timeout: Duration,
}

impl AckForwarder {
    /// Creates a forwarder posting to `{base_url}/api/admin/messages/ack`.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, ForwardError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            ForwardError::Configuration(format!("failed to create HTTP client: {e}"))
        })?;

        let base_url = base_url.as_ref().trim_end_matches('/');

        Ok(Self {
            http_client,
            ack_url: format!("{base_url}{ACK_PATH}"),
            timeout,
        })
    }

    /// Reports `message_id` as delivered to `recipient_id`.
    ///
    /// # Errors
    ///
    /// - [`ForwardError::Timeout`] - the request exceeded the configured timeout
    /// - [`ForwardError::Unavailable`] - the system of record is unreachable
    /// - [`ForwardError::Rejected`] - non-success status
    pub async fn forward_delivered(
        &self,
        token: &str,
        message_id: &str,
        recipient_id: &str,
    ) -> Result<(), ForwardError> {
        debug!(message_id, recipient_id, "Forwarding delivery acknowledgment");

        let body = AckBody {
            message_id,
            recipient_id,
            new_status: STATUS_DELIVERED,
        };

        let response = self
            .http_client
            .post(&self.ack_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(self.timeout)
                } else if e.is_connect() {
                    ForwardError::Unavailable(format!("connection failed: {e}"))
                } else {
                    ForwardError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, message_id, "System of record rejected acknowledgment");
            return Err(ForwardError::Rejected(status.as_u16()));
        }

        debug!(message_id, "Delivery acknowledgment forwarded");
        Ok(())
    }

    /// Returns the full acknowledgment URL.
    pub fn ack_url(&self) -> &str {
        &self.ack_url
    }
}
