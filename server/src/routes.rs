//! HTTP route handlers for the Herald gateway.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /api/broadcast-message` - Trigger a notification (backend services)
//! - `POST /api/broadcasting/auth` - Channel join authorization callback
//! - `GET /api/pending-notifications` - Re-emit the caller's pending notifications
//! - `GET /ws` - WebSocket realtime transport
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`]: configuration,
//! the identity resolver, the channel authorizer, the dispatcher and the
//! services each WebSocket connection needs.
//!
//! # Example
//!
//! ```rust,no_run
//! use herald_server::config::Config;
//! use herald_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::ack::AckProcessor;
use crate::auth::{verify_app_credentials, AppCredentials, HEADER_APP_ID, HEADER_APP_SECRET};
use crate::authority::{AuthorityClient, HEADER_ACCESS_TOKEN, HEADER_ACTOR_TYPE, HEADER_SESSION_ID};
use crate::broadcast::EventBroadcaster;
use crate::channel::ChannelAuthorizer;
use crate::config::Config;
use crate::connection::{Connection, ConnectionContext, OUTBOUND_QUEUE_CAPACITY};
use crate::dispatcher::{DispatchRequest, NotificationDispatcher};
use crate::error::{AuthError, DispatchError, ServerError};
use crate::forwarder::AckForwarder;
use crate::identity::{IdentityCache, IdentityCacheConfig};
use crate::resolver::{AuthResolver, Credentials};
use crate::store::NotificationStore;
use crate::types::PresenceProfile;

// ============================================================================
// Constants
// ============================================================================

/// Maximum body size for API requests (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Message returned after a successful broadcast trigger.
const BROADCAST_OK_MESSAGE: &str = "Data broadcasted!";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    pub resolver: AuthResolver,

    pub authorizer: ChannelAuthorizer,

    pub dispatcher: NotificationDispatcher,

    /// Services handed to each WebSocket connection.
    pub connections: ConnectionContext,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wires every component from the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if an HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let cache = Arc::new(IdentityCache::new(IdentityCacheConfig::default()));
        Self::with_components(
            config,
            cache,
            Arc::new(NotificationStore::default()),
            EventBroadcaster::new(),
        )
    }

    /// Wires state around existing storage and transport.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if an HTTP client cannot be built.
    pub fn with_components(
        config: Config,
        cache: Arc<IdentityCache>,
        store: Arc<NotificationStore>,
        broadcaster: EventBroadcaster,
    ) -> Result<Self, ServerError> {
        let authority = AuthorityClient::new(&config.auth_server_url, config.upstream_timeout)
            .map_err(|e| ServerError::internal(e.to_string()))?;

        let forwarder = config
            .ack_forward_url
            .as_deref()
            .map(|url| AckForwarder::new(url, config.upstream_timeout))
            .transpose()
            .map_err(|e| ServerError::internal(e.to_string()))?;

        let resolver = AuthResolver::new(cache, authority, config.identity_ttl);
        let authorizer = ChannelAuthorizer::new(resolver.clone());
        let dispatcher = NotificationDispatcher::new(Arc::clone(&store), broadcaster.clone());
        let processor = AckProcessor::new(store, broadcaster.clone(), forwarder);
        let connections = ConnectionContext::new(
            authorizer.clone(),
            dispatcher.clone(),
            processor,
            broadcaster,
        );

        Ok(Self {
            config: Arc::new(config),
            resolver,
            authorizer,
            dispatcher,
            connections,
            start_time: Instant::now(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("dispatcher", &self.dispatcher)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/api/broadcast-message", post(post_broadcast_message))
        .route("/api/broadcasting/auth", post(post_broadcasting_auth))
        .route("/api/pending-notifications", get(get_pending_notifications))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn error_response(status: StatusCode, error: &str, code: &str) -> Response {
    (status, Json(ErrorResponse::new(error).with_code(code))).into_response()
}

/// Maps an auth failure to a response. The reason is never exposed.
fn auth_error_response(err: &AuthError) -> Response {
    match err {
        AuthError::Unauthenticated(_) => {
            error_response(StatusCode::UNAUTHORIZED, "unauthenticated", "unauthenticated")
        }
        AuthError::Denied(_) => error_response(StatusCode::FORBIDDEN, "forbidden", "denied"),
    }
}

/// Reads identity credentials from the `access-token`, `session-id` and
/// `x-actor-type` headers.
fn credentials_from_headers(headers: &HeaderMap) -> Result<Credentials, AuthError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    Credentials::from_parts(
        header(HEADER_ACCESS_TOKEN),
        header(HEADER_SESSION_ID),
        header(HEADER_ACTOR_TYPE),
    )
}

// ============================================================================
// POST /api/broadcast-message - Broadcast Trigger
// ============================================================================

/// Response body for a successful broadcast trigger.
#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub message: String,
    pub notification_id: String,
    pub recipients: Vec<String>,
}

/// POST /api/broadcast-message - Persist and emit a notification.
///
/// # Authentication
///
/// `X-App-ID` and `X-App-Secret` headers, or `app_id` and `app_secret` body
/// fields, must match the configured application credentials.
///
/// # Request Body
///
/// ```json
/// {"channel": "user.42", "event": "order.created", "data": {...},
///  "title": "optional", "userIds": ["42"] }
/// ```
///
/// `userIds` may also be a comma-separated string.
///
/// # Responses
///
/// - `200 OK` - Notification stored and emitted
/// - `400 Bad Request` - Malformed JSON, or missing `data`, `channel` or `event`
/// - `401 Unauthorized` - Missing or wrong application credentials
/// - `500 Internal Server Error` - The notification could not be stored
async fn post_broadcast_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed: Result<Value, _> = if body.is_empty() {
        Ok(Value::Object(serde_json::Map::new()))
    } else {
        serde_json::from_slice(&body)
    };

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let body_field = |name: &str| {
        parsed
            .as_ref()
            .ok()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
    };
    let presented = AppCredentials::new(header(HEADER_APP_ID), header(HEADER_APP_SECRET))
        .or(AppCredentials::new(body_field("app_id"), body_field("app_secret")));

    if let Err(err) = verify_app_credentials(&presented, &state.config.app_id, &state.config.app_secret) {
        warn!(reason = %err, app_id = ?presented.app_id, "Rejected broadcast trigger");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Unauthorized application",
            "unauthorized",
        );
    }

    let request: DispatchRequest = match parsed.and_then(serde_json::from_value) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "Invalid broadcast request body");
            return error_response(StatusCode::BAD_REQUEST, "invalid JSON body", "invalid_json");
        }
    };

    match state.dispatcher.dispatch(request) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(BroadcastResponse {
                message: BROADCAST_OK_MESSAGE.to_string(),
                notification_id: outcome.notification.id,
                recipients: outcome.recipients,
            }),
        )
            .into_response(),
        Err(DispatchError::InvalidRequest(message)) => {
            error_response(StatusCode::BAD_REQUEST, &message, "invalid_request")
        }
        Err(DispatchError::Persistence(err)) => {
            error!(error = %err, "Broadcast trigger failed to persist");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to store notification",
                "persistence_failure",
            )
        }
    }
}

// ============================================================================
// POST /api/broadcasting/auth - Channel Join Authorization
// ============================================================================

/// Request body for the join authorization callback.
#[derive(Debug, Deserialize)]
pub struct ChannelAuthRequest {
    #[serde(default, alias = "channel")]
    pub channel_name: Option<String>,
}

/// Response body for an authorized join.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub channel_data: PresenceProfile,
}

/// POST /api/broadcasting/auth - Decide whether the caller may join a channel.
///
/// # Responses
///
/// - `200 OK` - `{"channel_data": {"user_id", "name", "type"}}`
/// - `400 Bad Request` - No `channel_name`
/// - `401 Unauthorized` - Credentials missing or not accepted
/// - `403 Forbidden` - Channel namespace does not admit the actor type
async fn post_broadcasting_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel = serde_json::from_slice::<ChannelAuthRequest>(&body)
        .ok()
        .and_then(|req| req.channel_name)
        .filter(|c| !c.is_empty());

    let Some(channel) = channel else {
        return error_response(StatusCode::BAD_REQUEST, "channel_name required", "invalid_request");
    };

    let credentials = match credentials_from_headers(&headers) {
        Ok(credentials) => credentials,
        Err(err) => return auth_error_response(&err),
    };

    match state.authorizer.join(&credentials, &channel).await {
        Ok((_, profile)) => (
            StatusCode::OK,
            Json(ChannelAuthResponse {
                channel_data: profile,
            }),
        )
            .into_response(),
        Err(err) => {
            debug!(channel = %channel, error = %err, "Join authorization refused");
            auth_error_response(&err)
        }
    }
}

// ============================================================================
// GET /api/pending-notifications - Redelivery
// ============================================================================

/// Response body for the redelivery endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub message: String,
    pub count: usize,
}

/// GET /api/pending-notifications - Re-emit everything still pending for the caller.
async fn get_pending_notifications(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let credentials = match credentials_from_headers(&headers) {
        Ok(credentials) => credentials,
        Err(err) => return auth_error_response(&err),
    };

    let identity = match state.resolver.resolve(&credentials).await {
        Ok(identity) => identity,
        Err(err) => return auth_error_response(&err),
    };

    let count = state.dispatcher.redeliver_pending(&identity.external_user_id);

    Json(PendingResponse {
        message: "Pending notifications re-broadcasted".to_string(),
        count,
    })
    .into_response()
}

// ============================================================================
// GET /ws - WebSocket Transport
// ============================================================================

/// Query parameters for the WebSocket upgrade. Identity headers are used
/// for anything not given here.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub actor_type: Option<String>,
}

impl WsQueryParams {
    fn credentials(&self, headers: &HeaderMap) -> Result<Credentials, AuthError> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Credentials::from_parts(
            self.token.as_deref().or_else(|| header(HEADER_ACCESS_TOKEN)),
            self.session_id.as_deref().or_else(|| header(HEADER_SESSION_ID)),
            self.actor_type.as_deref().or_else(|| header(HEADER_ACTOR_TYPE)),
        )
    }
}

/// GET /ws - WebSocket realtime transport.
///
/// Credentials are checked for presence here; they are resolved against the
/// identity cache and the external authority on every `subscribe`.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `401 Unauthorized` - Missing token or session id, or unknown actor type
/// - `426 Upgrade Required` - Not a WebSocket upgrade request
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let credentials = match params.credentials(&headers) {
        Ok(credentials) if credentials.pair().is_some() => credentials,
        Ok(_) => {
            debug!("Missing token or session id in WebSocket request");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "missing credentials",
                "missing_credentials",
            );
        }
        Err(err) => return auth_error_response(&err),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(actor = %credentials.actor_type, "WebSocket client connecting");

    let context = state.connections.clone();
    ws.on_upgrade(move |socket| handle_websocket(socket, context, credentials))
}

/// Drives an established WebSocket connection.
async fn handle_websocket(
    socket: axum::extract::ws::WebSocket,
    context: ConnectionContext,
    credentials: Credentials,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let event_rx = context.broadcaster.subscribe();
    let mut connection = Connection::new(context, credentials, outbound_tx);
    let pump = connection.spawn_event_pump(event_rx);
    let connection_id = connection.id();

    info!(connection_id, "WebSocket client connected");

    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if let Err(err) = sender.send(Message::Text(json.into())).await {
                        debug!(error = %err, "Failed to send frame to WebSocket client");
                        break;
                    }
                }
                Err(err) => error!(error = %err, "Failed to serialize frame"),
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => {
                debug!(connection_id, "WebSocket client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(connection_id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    connection.close();
    pump.abort();
    write_task.abort();
    info!(connection_id, "WebSocket client disconnected");
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of active WebSocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::types::DeliveryStatus;

    const APP_ID: &str = "herald-test";
    const APP_SECRET: &str = "test-secret";

    fn test_config(auth_url: &str) -> Config {
        Config::new(auth_url, APP_ID, APP_SECRET)
    }

    fn test_state(auth_url: &str) -> AppState {
        AppState::new(test_config(auth_url)).unwrap()
    }

    async fn authority() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("access-token", "tok-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": "42",
                "type": "user",
                "name": "Ama"
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;
        mock_server
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn broadcast_request(body: Value, with_headers: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/broadcast-message")
            .header("content-type", "application/json");
        if with_headers {
            builder = builder
                .header("X-App-ID", APP_ID)
                .header("X-App-Secret", APP_SECRET);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    // ========================================================================
    // Health endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    // ========================================================================
    // Broadcast trigger tests
    // ========================================================================

    #[tokio::test]
    async fn broadcast_stores_and_reports_recipients() {
        let state = test_state("http://127.0.0.1:1");
        let store = Arc::clone(state.dispatcher.store());
        let app = create_router(state);

        let response = app
            .oneshot(broadcast_request(
                json!({
                    "channel": "user.42",
                    "event": "order.created",
                    "data": {"message": "shipped"},
                    "userIds": "42, 43"
                }),
                true,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: BroadcastResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.message, "Data broadcasted!");
        assert_eq!(body.recipients, vec!["42", "43"]);

        let row = store.get_delivery("43", &body.notification_id).unwrap();
        assert_eq!(row.status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn broadcast_accepts_body_credentials() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let response = app
            .oneshot(broadcast_request(
                json!({
                    "app_id": APP_ID,
                    "app_secret": APP_SECRET,
                    "channel": "lobby",
                    "event": "announcement",
                    "data": {"message": "hello"}
                }),
                false,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn broadcast_rejects_bad_credentials_without_side_effects() {
        let state = test_state("http://127.0.0.1:1");
        let store = Arc::clone(state.dispatcher.store());
        let app = create_router(state);

        let response = app
            .oneshot(broadcast_request(
                json!({
                    "app_id": APP_ID,
                    "app_secret": "wrong",
                    "channel": "user.42",
                    "event": "e",
                    "data": {"x": 1}
                }),
                false,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Unauthorized application"));
        assert_eq!(store.notification_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_requires_data_channel_and_event() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let response = app
            .oneshot(broadcast_request(
                json!({"channel": "user.42", "event": "e", "data": {}}),
                true,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("Data, channel, and event required"));
        assert_eq!(body["code"], json!("invalid_request"));
    }

    #[tokio::test]
    async fn broadcast_rejects_malformed_json() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/broadcast-message")
            .header("X-App-ID", APP_ID)
            .header("X-App-Secret", APP_SECRET)
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // ========================================================================
    // Join authorization tests
    // ========================================================================

    fn auth_request(token: &str, actor: &str, channel: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/broadcasting/auth")
            .header("access-token", token)
            .header("session-id", "s1")
            .header("x-actor-type", actor)
            .header("content-type", "application/json")
            .body(Body::from(json!({"channel_name": channel}).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn join_auth_returns_presence_profile() {
        let mock_server = authority().await;
        let app = create_router(test_state(&mock_server.uri()));

        let response = app
            .oneshot(auth_request("tok-42", "user", "user.42"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"channel_data": {"user_id": "42", "name": "Ama", "type": "user"}})
        );
    }

    #[tokio::test]
    async fn join_auth_denies_wrong_namespace() {
        let mock_server = authority().await;
        let app = create_router(test_state(&mock_server.uri()));

        let response = app
            .oneshot(auth_request("tok-42", "worker", "user.42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn join_auth_rejects_unknown_token() {
        let mock_server = authority().await;
        let app = create_router(test_state(&mock_server.uri()));

        let response = app
            .oneshot(auth_request("bogus", "user", "lobby"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], json!("unauthenticated"));
    }

    #[tokio::test]
    async fn join_auth_requires_channel_name() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/broadcasting/auth")
            .header("access-token", "tok-42")
            .header("session-id", "s1")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // ========================================================================
    // Pending notification tests
    // ========================================================================

    #[tokio::test]
    async fn pending_notifications_counts_redeliveries() {
        let mock_server = authority().await;
        let state = test_state(&mock_server.uri());
        state
            .dispatcher
            .dispatch(DispatchRequest {
                channel: "user.42".to_string(),
                event: "order.created".to_string(),
                data: json!({"message": "one"}),
                ..DispatchRequest::default()
            })
            .unwrap();
        let app = create_router(state);

        let request = Request::builder()
            .uri("/api/pending-notifications")
            .header("access-token", "tok-42")
            .header("session-id", "s1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: PendingResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.count, 1);
    }

    #[tokio::test]
    async fn pending_notifications_requires_identity() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/pending-notifications")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ========================================================================
    // WebSocket endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn ws_without_credentials_is_rejected() {
        let app = create_router(test_state("http://127.0.0.1:1"));

        let request = Request::builder()
            .uri("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn ws_query_params_fall_back_to_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("session-id", "from-header".parse().unwrap());
        headers.insert("x-actor-type", "worker".parse().unwrap());

        let params = WsQueryParams {
            token: Some("from-query".to_string()),
            ..WsQueryParams::default()
        };
        let creds = params.credentials(&headers).unwrap();

        assert_eq!(creds.pair(), Some(("from-query", "from-header")));
        assert_eq!(creds.actor_type, crate::types::ActorType::Worker);
    }

    #[test]
    fn app_state_debug_hides_secret() {
        let state = test_state("http://127.0.0.1:1");
        let debug = format!("{state:?}");
        assert!(!debug.contains(APP_SECRET));
    }
}
