//! Application credential check for the broadcast-trigger API.
//!
//! Backend services that trigger broadcasts present an application id and
//! secret, either as `X-App-ID` / `X-App-Secret` headers or as `app_id` /
//! `app_secret` body fields. Headers win when both are present.
//!
//! # Example
//!
//! ```rust
//! use herald_server::auth::{verify_app_credentials, AppCredentials, AppAuthError};
//!
//! let presented = AppCredentials::new(Some("herald"), Some("s3cret"));
//! assert!(verify_app_credentials(&presented, "herald", "s3cret").is_ok());
//!
//! let wrong = AppCredentials::new(Some("herald"), Some("guess"));
//! assert_eq!(
//!     verify_app_credentials(&wrong, "herald", "s3cret"),
//!     Err(AppAuthError::InvalidCredentials)
//! );
//! ```

use std::fmt;

use subtle::ConstantTimeEq;
use thiserror::Error;

/// Header carrying the application id.
pub const HEADER_APP_ID: &str = "x-app-id";

/// Header carrying the application secret.
pub const HEADER_APP_SECRET: &str = "x-app-secret";

/// Errors returned by [`verify_app_credentials`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppAuthError {
    /// No id or no secret was presented.
    #[error("missing application credentials")]
    Missing,

    /// The id or the secret did not match. Which one is not reported.
    #[error("invalid application credentials")]
    InvalidCredentials,
}

/// Credentials presented by a caller. Debug output redacts the secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AppCredentials {
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
}

impl AppCredentials {
    pub fn new(app_id: Option<&str>, app_secret: Option<&str>) -> Self {
        Self {
            app_id: app_id.map(str::to_string),
            app_secret: app_secret.map(str::to_string),
        }
    }

    /// Takes each field from `self`, falling back to `other` when absent.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            app_id: self.app_id.or(other.app_id),
            app_secret: self.app_secret.or(other.app_secret),
        }
    }
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Compares presented credentials against the configured ones.
///
/// Both comparisons run in constant time and both always run, so timing
/// reveals neither which field was wrong nor how much of it matched.
///
/// # Errors
///
/// - [`AppAuthError::Missing`] - id or secret absent or empty
/// - [`AppAuthError::InvalidCredentials`] - mismatch
pub fn verify_app_credentials(
    presented: &AppCredentials,
    expected_id: &str,
    expected_secret: &str,
) -> Result<(), AppAuthError> {
    let (Some(app_id), Some(secret)) = (
        presented.app_id.as_deref().filter(|s| !s.is_empty()),
        presented.app_secret.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return Err(AppAuthError::Missing);
    };

    let id_ok = app_id.as_bytes().ct_eq(expected_id.as_bytes());
    let secret_ok = secret.as_bytes().ct_eq(expected_secret.as_bytes());

    if bool::from(id_ok & secret_ok) {
        Ok(())
    } else {
        Err(AppAuthError::InvalidCredentials)
    }
}
