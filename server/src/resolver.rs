//! Identity resolution: identity cache first, external authority second.
//!
//! # Algorithm
//!
//! 1. Missing token or session id: unauthenticated, no external call.
//! 2. Cache probe. A live row with the requested actor type is returned as
//!    is. A live row issued for another actor type is a hard rejection.
//! 3. Otherwise the external authority is asked. Any failure there is
//!    reported as unauthenticated; callers cannot tell a dead authority from a
//!    bad token.
//! 4. The authority's actor type (or the requested one if it sent none) must
//!    equal the requested actor type.
//! 5. The result is written back to the cache with a fresh expiry.
//!
//! Tokens are actor-type scoped: a mismatch is never downgraded to a lesser
//! privilege.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::authority::AuthorityClient;
use crate::error::AuthError;
use crate::identity::{CacheProbe, IdentityCache};
use crate::types::{ActorType, IdentityRecord};

/// Credentials presented by a connecting client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub actor_type: ActorType,
}

impl Credentials {
    pub fn new(
        token: impl Into<String>,
        session_id: impl Into<String>,
        actor_type: ActorType,
    ) -> Self {
        Self {
            token: Some(token.into()),
            session_id: Some(session_id.into()),
            actor_type,
        }
    }

    /// Builds credentials from raw transport values.
    ///
    /// Empty strings count as absent. A missing actor type means `user`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] for an unrecognised actor type.
    pub fn from_parts(
        token: Option<&str>,
        session_id: Option<&str>,
        actor_type: Option<&str>,
    ) -> Result<Self, AuthError> {
        let actor_type = match actor_type.map(str::trim).filter(|a| !a.is_empty()) {
            Some(raw) => raw
                .parse::<ActorType>()
                .map_err(|e| AuthError::unauthenticated(e.to_string()))?,
            None => ActorType::default(),
        };

        Ok(Self {
            token: non_empty(token),
            session_id: non_empty(session_id),
            actor_type,
        })
    }

    /// Returns the token and session id if both are present.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (self.token.as_deref(), self.session_id.as_deref()) {
            (Some(token), Some(session)) => Some((token, session)),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("session_id", &self.session_id.as_ref().map(|_| "<redacted>"))
            .field("actor_type", &self.actor_type)
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves credentials to an identity.
///
/// Cheap to clone: the cache is shared and the authority client is
/// reference-counted.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    cache: Arc<IdentityCache>,
    authority: AuthorityClient,
    ttl: chrono::Duration,
}

impl AuthResolver {
    /// Creates a resolver that caches slow-path results for `ttl`.
    pub fn new(cache: Arc<IdentityCache>, authority: AuthorityClient, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            cache,
            authority,
            ttl,
        }
    }

    /// Returns the shared identity cache.
    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Resolves credentials to an identity record.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] when the credentials are
    /// missing, unknown, expired, or bound to another actor type, and when
    /// the external authority fails in any way.
    pub async fn resolve(&self, credentials: &Credentials) -> Result<IdentityRecord, AuthError> {
        let Some((token, session_id)) = credentials.pair() else {
            debug!(
                token = credentials.token.is_some(),
                session = credentials.session_id.is_some(),
                "Credentials incomplete"
            );
            return Err(AuthError::unauthenticated("missing token or session id"));
        };
        let requested = credentials.actor_type;

        match self.cache.probe(token, session_id, requested) {
            CacheProbe::Hit(record) => {
                debug!(user_id = %record.external_user_id, actor = %requested, "Resolved identity from cache");
                return Ok(record);
            }
            CacheProbe::ActorMismatch { cached } => {
                warn!(
                    cached_type = %cached,
                    requested_actor = %requested,
                    "Actor type mismatch in identity cache"
                );
                return Err(AuthError::unauthenticated("actor type mismatch in cache"));
            }
            CacheProbe::Miss => {}
        }

        // No lock is held past this point while the authority is called.
        let verified = match self.authority.verify(token, session_id, requested).await {
            Ok(verified) => verified,
            Err(err) => {
                warn!(error = %err, actor = %requested, "External authority verification failed");
                return Err(AuthError::unauthenticated("external authority refused"));
            }
        };

        let returned = match verified.actor_type {
            None => requested,
            Some(Ok(actor)) => actor,
            Some(Err(unknown)) => {
                warn!(expected = %requested, received = %unknown, "Authority returned unknown actor type");
                return Err(AuthError::unauthenticated("unknown actor type from authority"));
            }
        };

        if returned != requested {
            warn!(
                expected = %requested,
                received = %returned,
                "Actor type mismatch between authority and request"
            );
            return Err(AuthError::unauthenticated("actor type mismatch from authority"));
        }

        let record = IdentityRecord {
            id: 0,
            external_user_id: verified.user_id,
            session_id: session_id.to_string(),
            token: token.to_string(),
            actor_type: returned,
            display_name: verified.name,
            expires_at: Utc::now()
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let record = match self.cache.store(record.clone()) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, user_id = %record.external_user_id, "Failed to cache identity");
                record
            }
        };

        info!(
            user_id = %record.external_user_id,
            actor = %record.actor_type,
            "Identity verified via external authority"
        );

        Ok(record)
    }
}
