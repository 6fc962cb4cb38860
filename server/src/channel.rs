//! Channel join authorization.
//!
//! Channel names are partitioned into namespaces by prefix:
//!
//! | Pattern      | Scope  | Admits        |
//! |--------------|--------|---------------|
//! | `user.<id>`  | User   | `user` only   |
//! | `worker.<id>`| Worker | `worker` only |
//! | anything else| Open   | any identity  |
//!
//! Every join is decided afresh; decisions are never cached.

use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::resolver::{AuthResolver, Credentials};
use crate::types::{ActorType, IdentityRecord, PresenceProfile};

/// Namespace a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScope {
    User,
    Worker,
    Open,
}

impl ChannelScope {
    /// Classifies a channel name.
    ///
    /// `user.` or `worker.` followed by at least one character selects the
    /// restricted scope. A bare `user.` is open.
    pub fn parse(channel: &str) -> Self {
        match channel.split_once('.') {
            Some(("user", rest)) if !rest.is_empty() => Self::User,
            Some(("worker", rest)) if !rest.is_empty() => Self::Worker,
            _ => Self::Open,
        }
    }

    /// Actor type required by this scope, if any.
    pub fn required_actor(&self) -> Option<ActorType> {
        match self {
            Self::User => Some(ActorType::User),
            Self::Worker => Some(ActorType::Worker),
            Self::Open => None,
        }
    }

    /// Returns true if an actor of `actor_type` may join a channel of this scope.
    pub fn admits(&self, actor_type: ActorType) -> bool {
        match self.required_actor() {
            Some(required) => required == actor_type,
            None => true,
        }
    }
}

/// Decides whether an identity may join a channel.
#[derive(Debug, Clone)]
pub struct ChannelAuthorizer {
    resolver: AuthResolver,
}

impl ChannelAuthorizer {
    pub fn new(resolver: AuthResolver) -> Self {
        Self { resolver }
    }

    /// Returns the resolver used by [`join`](Self::join).
    pub fn resolver(&self) -> &AuthResolver {
        &self.resolver
    }

    /// Authorizes an already-resolved identity on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Denied`] if the channel's namespace requires a
    /// different actor type.
    pub fn authorize_join(
        &self,
        identity: &IdentityRecord,
        channel: &str,
    ) -> Result<PresenceProfile, AuthError> {
        let scope = ChannelScope::parse(channel);

        if !scope.admits(identity.actor_type) {
            warn!(
                channel,
                user_id = %identity.external_user_id,
                actor = %identity.actor_type,
                "Channel join denied by namespace"
            );
            return Err(AuthError::denied(format!(
                "{} may not join {scope:?} channel",
                identity.actor_type
            )));
        }

        debug!(channel, user_id = %identity.external_user_id, "Channel join authorized");
        Ok(PresenceProfile::from(identity))
    }

    /// Resolves `credentials` and authorizes the result on `channel`.
    ///
    /// The claimed actor type is checked against the channel namespace
    /// before the resolver runs, so a request that can never succeed does
    /// not reach the external authority.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Unauthenticated`] - missing or invalid credentials
    /// - [`AuthError::Denied`] - the namespace does not admit the actor type
    pub async fn join(
        &self,
        credentials: &Credentials,
        channel: &str,
    ) -> Result<(IdentityRecord, PresenceProfile), AuthError> {
        if credentials.pair().is_none() {
            return Err(AuthError::unauthenticated("missing token or session id"));
        }

        if !ChannelScope::parse(channel).admits(credentials.actor_type) {
            info!(
                channel,
                actor = %credentials.actor_type,
                "Claimed actor type cannot join channel"
            );
            return Err(AuthError::denied("claimed actor type cannot join channel"));
        }

        let identity = self.resolver.resolve(credentials).await?;
        let profile = self.authorize_join(&identity, channel)?;
        Ok((identity, profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::authority::AuthorityClient;
    use crate::identity::IdentityCache;

    fn identity(actor_type: ActorType) -> IdentityRecord {
        IdentityRecord {
            id: 1,
            external_user_id: "7".to_string(),
            session_id: "s1".to_string(),
            token: "t1".to_string(),
            actor_type,
            display_name: Some("Ama".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn authorizer(url: &str) -> ChannelAuthorizer {
        let authority = AuthorityClient::new(url, Duration::from_secs(2)).unwrap();
        ChannelAuthorizer::new(AuthResolver::new(
            Arc::new(IdentityCache::default()),
            authority,
            Duration::from_secs(3600),
        ))
    }

    #[test]
    fn scope_parse() {
        assert_eq!(ChannelScope::parse("user.7"), ChannelScope::User);
        assert_eq!(ChannelScope::parse("user.7.inbox"), ChannelScope::User);
        assert_eq!(ChannelScope::parse("worker.w9"), ChannelScope::Worker);
        assert_eq!(ChannelScope::parse("user."), ChannelScope::Open);
        assert_eq!(ChannelScope::parse("users.7"), ChannelScope::Open);
        assert_eq!(ChannelScope::parse("chat.room-1"), ChannelScope::Open);
        assert_eq!(ChannelScope::parse("lobby"), ChannelScope::Open);
    }

    #[test]
    fn user_namespace_admits_users_only() {
        let auth = authorizer("http://127.0.0.1:1");
        assert!(auth.authorize_join(&identity(ActorType::User), "user.7").is_ok());

        let err = auth
            .authorize_join(&identity(ActorType::Worker), "user.7")
            .unwrap_err();
        assert!(err.is_denied());
    }

    #[test]
    fn worker_namespace_admits_workers_only() {
        let auth = authorizer("http://127.0.0.1:1");
        assert!(auth.authorize_join(&identity(ActorType::Worker), "worker.9").is_ok());
        assert!(auth
            .authorize_join(&identity(ActorType::User), "worker.9")
            .unwrap_err()
            .is_denied());
    }

    #[test]
    fn open_channels_admit_any_actor() {
        let auth = authorizer("http://127.0.0.1:1");
        let profile = auth
            .authorize_join(&identity(ActorType::Worker), "chat.room-1")
            .unwrap();
        assert_eq!(profile.user_id, "7");
        assert_eq!(profile.name, "Ama");
        assert_eq!(profile.actor_type, ActorType::Worker);
    }

    #[tokio::test]
    async fn join_denies_claimed_actor_before_calling_authority() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let auth = authorizer(&mock_server.uri());
        let creds = Credentials::new("t1", "s1", ActorType::Worker);
        let err = auth.join(&creds, "user.7").await.unwrap_err();

        assert!(err.is_denied());
    }

    #[tokio::test]
    async fn join_resolves_and_returns_presence() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_id": 7,
                "type": "user"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let auth = authorizer(&mock_server.uri());
        let creds = Credentials::new("t1", "s1", ActorType::User);
        let (identity, profile) = auth.join(&creds, "user.7").await.unwrap();

        assert_eq!(identity.external_user_id, "7");
        assert_eq!(profile.name, "User");
    }

    #[tokio::test]
    async fn join_without_credentials_is_unauthenticated() {
        let auth = authorizer("http://127.0.0.1:1");
        let creds = Credentials::from_parts(None, Some("s1"), None).unwrap();

        let err = auth.join(&creds, "lobby").await.unwrap_err();
        assert!(err.is_unauthenticated());
    }
}
