//! Error types for the Herald gateway.
//!
//! This module defines the error taxonomy shared by the core components:
//!
//! - [`AuthError`] - identity resolution and channel authorization failures
//! - [`DispatchError`] - broadcast-trigger failures
//! - [`ServerError`] - startup failures surfaced by the binary
//!
//! Upstream failures (external authority, downstream system of record) have
//! their own error types in [`crate::authority`] and [`crate::forwarder`]; they
//! are folded into [`AuthError::Unauthenticated`] or logged and swallowed, and
//! never reach a client directly.

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Authentication and authorization failures.
///
/// The reason is kept for logging. Clients only ever learn which of the two
/// variants occurred, never why.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token or session missing, expired, unknown, or actor-type mismatch.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated, but not permitted on the requested channel.
    #[error("denied: {0}")]
    Denied(String),
}

impl AuthError {
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Unauthenticated(reason.into())
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied(reason.into())
    }

    /// Returns `true` for [`AuthError::Unauthenticated`].
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }

    /// Returns `true` for [`AuthError::Denied`].
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

/// Failures of the broadcast-trigger path.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Missing or empty `data`, `channel` or `event`. Nothing was written.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Notification or delivery rows could not be written; the dispatch was
    /// aborted before emission.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Top-level error type for the Herald server.
///
/// Only startup can fail at this level: configuration that does not load or
/// validate, and HTTP clients that cannot be built. Request-path failures are
/// answered where they occur and never escalate here.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),

    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Internal(_) => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl ServerError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
