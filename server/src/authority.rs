//! Client for the external authentication authority.
//!
//! The authority is the system that actually issued the tokens clients
//! present. It is asked to verify a `(token, session_id, actor_type)` triple
//! and answers with the identity behind it.
//!
//! # Protocol
//!
//! ```text
//! GET {auth_server_url}
//! access-token: <token>
//! session-id:   <session id>
//! x-actor-type: user | worker
//!
//! 200 {"user_id": "42", "type": "user", "name": "Ama"}
//! ```
//!
//! `user_id` may be a string or a number; `type` and `name` are optional.
//! Any non-2xx status, transport failure, timeout, unparseable body or
//! missing `user_id` is an error.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{deserialize_loose_id, ActorType};

/// Header carrying the client's access token.
pub const HEADER_ACCESS_TOKEN: &str = "access-token";

/// Header carrying the client's session id.
pub const HEADER_SESSION_ID: &str = "session-id";

/// Header carrying the claimed actor type.
pub const HEADER_ACTOR_TYPE: &str = "x-actor-type";

/// Errors that can occur when asking the authority to verify a token.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority answered with a non-success status.
    #[error("authority rejected the token with status {0}")]
    Rejected(u16),

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The authority could not be reached.
    #[error("authority unavailable: {0}")]
    Unavailable(String),

    /// The response body did not match the expected schema.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// Identity asserted by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,

    /// Actor type claimed by the authority. `None` if the field was absent.
    /// An unrecognised value is kept verbatim so the caller can reject it.
    pub actor_type: Option<Result<ActorType, String>>,

    pub name: Option<String>,
}

/// Raw response body from the authority.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default, deserialize_with = "deserialize_loose_id")]
    user_id: Option<String>,

    #[serde(default, rename = "type")]
    actor_type: Option<String>,

    #[serde(default)]
    name: Option<String>,
}

impl VerifyResponse {
    fn into_identity(self) -> Result<VerifiedIdentity, AuthorityError> {
        let user_id = self
            .user_id
            .ok_or_else(|| AuthorityError::InvalidResponse("missing user_id".to_string()))?;

        let actor_type = self
            .actor_type
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<ActorType>().map_err(|_| t));

        Ok(VerifiedIdentity {
            user_id,
            actor_type,
            name: self.name.filter(|n| !n.trim().is_empty()),
        })
    }
}

/// HTTP client for the external authority.
///
/// Cheap to clone; the inner `reqwest::Client` is reference-counted.
#[derive(Debug, Clone)]
pub struct AuthorityClient {
    http_client: Client,
    verify_url: String,
    timeout: Duration,
}

impl AuthorityClient {
    /// Creates a new authority client.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Configuration`] if the HTTP client cannot be created.
    pub fn new(verify_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthorityError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            AuthorityError::Configuration(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            http_client,
            verify_url: verify_url.into(),
            timeout,
        })
    }

    /// Asks the authority who owns `token` within `session_id`.
    ///
    /// # Errors
    ///
    /// - [`AuthorityError::Rejected`] - non-success status
    /// - [`AuthorityError::Timeout`] - the request exceeded the configured timeout
    /// - [`AuthorityError::Unavailable`] - the authority is unreachable
    /// - [`AuthorityError::InvalidResponse`] - unparseable body or missing `user_id`
    pub async fn verify(
        &self,
        token: &str,
        session_id: &str,
        actor_type: ActorType,
    ) -> Result<VerifiedIdentity, AuthorityError> {
        debug!(actor = %actor_type, "Verifying token with external authority");

        let response = self
            .http_client
            .get(&self.verify_url)
            .header(HEADER_ACCESS_TOKEN, token)
            .header(HEADER_SESSION_ID, session_id)
            .header(HEADER_ACTOR_TYPE, actor_type.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthorityError::Timeout(self.timeout)
                } else if e.is_connect() {
                    AuthorityError::Unavailable(format!("connection failed: {e}"))
                } else {
                    AuthorityError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            warn!(status = %status, "External authority rejected token");
            return Err(AuthorityError::Rejected(status.as_u16()));
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            AuthorityError::InvalidResponse(format!("failed to parse verify response: {e}"))
        })?;

        let identity = body.into_identity()?;

        debug!(user_id = %identity.user_id, "External authority verified token");

        Ok(identity)
    }
}
