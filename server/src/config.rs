//! Server configuration module.
//!
//! Parses configuration from environment variables for the Herald server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GATEWAY_AUTH_SERVER_URL` | Yes | - | External authority verify endpoint |
//! | `GATEWAY_APP_ID` | Yes | - | App id accepted by the broadcast-trigger API |
//! | `GATEWAY_APP_SECRET` | Yes | - | App secret accepted by the broadcast-trigger API |
//! | `GATEWAY_ACK_FORWARD_URL` | No | - | Base URL of the downstream system of record |
//! | `GATEWAY_IDENTITY_TTL_SECS` | No | 3600 | Lifetime of a cached identity |
//! | `GATEWAY_UPSTREAM_TIMEOUT_SECS` | No | 5 | Timeout for authority and forward calls |
//! | `GATEWAY_EVICTION_INTERVAL_SECS` | No | 300 | How often expired identities are evicted |
//! | `PORT` | No | 8080 | HTTP server port |

use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default identity cache window (one hour).
const DEFAULT_IDENTITY_TTL_SECS: u64 = 3600;

/// Upper bound for the identity cache window (30 days).
const MAX_IDENTITY_TTL_SECS: u64 = 30 * 24 * 3600;

/// Default timeout for upstream HTTP calls.
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;

/// Default interval between expired-identity sweeps.
const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 300;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// URL of the external authority's token verification endpoint.
    pub auth_server_url: String,

    /// App id for the broadcast-trigger API.
    pub app_id: String,

    /// App secret for the broadcast-trigger API.
    pub app_secret: String,

    /// Base URL of the downstream system of record. Forwarding is disabled
    /// when unset.
    pub ack_forward_url: Option<String>,

    /// How long a slow-path resolution stays in the identity cache.
    pub identity_ttl: Duration,

    /// Timeout applied to every upstream HTTP call.
    pub upstream_timeout: Duration,

    /// Interval of the background identity eviction sweep.
    pub eviction_interval: Duration,
}

impl Config {
    /// Creates a configuration with defaults for everything optional.
    pub fn new(
        auth_server_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_server_url: auth_server_url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            ack_forward_url: None,
            identity_ttl: Duration::from_secs(DEFAULT_IDENTITY_TTL_SECS),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            eviction_interval: Duration::from_secs(DEFAULT_EVICTION_INTERVAL_SECS),
        }
    }

    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing or empty
    /// - An environment variable has an invalid format
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use herald_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            auth_server_url: required_env("GATEWAY_AUTH_SERVER_URL")?,
            app_id: required_env("GATEWAY_APP_ID")?,
            app_secret: required_env("GATEWAY_APP_SECRET")?,
            ack_forward_url: optional_env("GATEWAY_ACK_FORWARD_URL"),
            identity_ttl: parse_secs("GATEWAY_IDENTITY_TTL_SECS", DEFAULT_IDENTITY_TTL_SECS)?,
            upstream_timeout: parse_secs(
                "GATEWAY_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?,
            eviction_interval: parse_secs(
                "GATEWAY_EVICTION_INTERVAL_SECS",
                DEFAULT_EVICTION_INTERVAL_SECS,
            )?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Upstream URLs must be absolute http(s) URLs, every duration must be
    /// non-zero, and the identity TTL may not exceed 30 days.
    fn validate(&self) -> Result<(), ConfigError> {
        check_url("GATEWAY_AUTH_SERVER_URL", &self.auth_server_url)?;

        if let Some(url) = &self.ack_forward_url {
            check_url("GATEWAY_ACK_FORWARD_URL", url)?;
        }

        if self.identity_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "GATEWAY_IDENTITY_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        if self.identity_ttl.as_secs() > MAX_IDENTITY_TTL_SECS {
            return Err(ConfigError::ValidationError(format!(
                "GATEWAY_IDENTITY_TTL_SECS must be at most {MAX_IDENTITY_TTL_SECS}"
            )));
        }

        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "GATEWAY_UPSTREAM_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        if self.eviction_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "GATEWAY_EVICTION_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("auth_server_url", &self.auth_server_url)
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("ack_forward_url", &self.ack_forward_url)
            .field("identity_ttl", &self.identity_ttl)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("eviction_interval", &self.eviction_interval)
            .finish()
    }
}

/// Reads a required, non-empty environment variable.
fn required_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

/// Reads an optional environment variable, treating empty as unset.
fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a whole-seconds duration variable, falling back to `default`.
fn parse_secs(name: &str, default: u64) -> Result<Duration, ConfigError> {
    match optional_env(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("expected whole seconds, got '{raw}': {e}"),
            }),
        None => Ok(Duration::from_secs(default)),
    }
}

fn check_url(var: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidFormat {
            var: var.to_string(),
            message: format!("expected an http(s) URL, got '{url}'"),
        })
    }
}
