//! End-to-end delivery scenarios.
//!
//! These tests wire the full application state the way the binary does and
//! drive it from both sides: backend triggers go through the HTTP router,
//! clients are driven through [`Connection`] with their outbound frames
//! read off the queue the socket writer would drain.
//!
//! # Scenarios
//!
//! - Trigger, reconnect, redelivery and acknowledgement with exactly one
//!   forward to the system of record, even when two tabs ack at once
//! - A cached worker token presented as a user is refused without a second
//!   authority call
//! - A worker joining a user channel is denied before any authority call

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use herald_server::config::Config;
use herald_server::connection::{
    Connection, ServerFrame, EVENT_SUBSCRIPTION_ERROR, EVENT_SUBSCRIPTION_SUCCEEDED,
    OUTBOUND_QUEUE_CAPACITY,
};
use herald_server::forwarder::ACK_PATH;
use herald_server::resolver::Credentials;
use herald_server::routes::{create_router, AppState};
use herald_server::types::{ActorType, DeliveryStatus};

// ============================================================================
// Test Helpers
// ============================================================================

const APP_ID: &str = "herald-it";
const APP_SECRET: &str = "it-secret";

/// Authority knowing one user (`tok-42`) and one worker (`tok-w9`).
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
    mock_server
}

async fn mount_worker(mock_server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(header("access-token", "tok-w9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": "9",
            "type": "worker",
            "name": "Kofi"
        })))
        .expect(expected_calls)
        .mount(mock_server)
        .await;
}

fn state(auth_url: &str, ack_url: Option<&str>) -> AppState {
    let mut config = Config::new(auth_url, APP_ID, APP_SECRET);
    config.ack_forward_url = ack_url.map(str::to_string);
    config.upstream_timeout = Duration::from_secs(2);
    AppState::new(config).unwrap()
}

/// A client connection with its outbound queue.
struct Client {
    connection: Connection,
    rx: mpsc::Receiver<ServerFrame>,
    pump: JoinHandle<()>,
}

impl Client {
    fn open(state: &AppState, token: &str, actor: ActorType) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let context = state.connections.clone();
        let events = context.broadcaster.subscribe();
        let connection = Connection::new(context, Credentials::new(token, "s1", actor), tx);
        let pump = connection.spawn_event_pump(events);
        Self {
            connection,
            rx,
            pump,
        }
    }

    async fn send(&mut self, frame: Value) {
        self.connection.handle_text(&frame.to_string()).await;
    }

    async fn next(&mut self) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("frame within timeout")
            .expect("queue open")
    }

    /// Skips frames until one named `event` arrives.
    async fn next_named(&mut self, event: &str) -> ServerFrame {
        loop {
            let frame = self.next().await;
            if frame.event == event {
                return frame;
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn trigger(state: &AppState, body: Value) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/api/broadcast-message")
        .header("content-type", "application/json")
        .header("X-App-ID", APP_ID)
        .header("X-App-Secret", APP_SECRET)
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Trigger, redelivery and acknowledgement
// ============================================================================

#[tokio::test]
async fn offline_notification_is_redelivered_and_acknowledged_once() {
    let auth_server = authority().await;
    let record_server = MockServer::start().await;
    let state = state(&auth_server.uri(), Some(&record_server.uri()));

    let response = trigger(
        &state,
        json!({
            "channel": "user.42",
            "event": "order.shipped",
            "title": "Shipped",
            "data": {"message": "Your order is on its way", "message_id": "m-1"}
        }),
    )
    .await;
    let notification_id = response["notification_id"].as_str().unwrap().to_string();
    assert_eq!(response["recipients"], json!(["42"]));

    Mock::given(method("POST"))
        .and(path(ACK_PATH))
        .and(header("authorization", "Bearer tok-42"))
        .and(body_json(json!({
            "messageId": "m-1",
            "recipientId": "42",
            "newStatus": "DELIVERED"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&record_server)
        .await;

    // Two tabs come online and both see the pending notification.
    let mut tab_a = Client::open(&state, "tok-42", ActorType::User);
    let mut tab_b = Client::open(&state, "tok-42", ActorType::User);

    tab_a
        .send(json!({"event": "subscribe", "channel": "user.42"}))
        .await;
    assert_eq!(
        tab_a.next().await.event,
        EVENT_SUBSCRIPTION_SUCCEEDED
    );
    let redelivered = tab_a.next_named("order.shipped").await;
    assert_eq!(redelivered.data["id"], json!(notification_id));
    assert_eq!(redelivered.data["title"], json!("Shipped"));

    tab_b
        .send(json!({"event": "subscribe", "channel": "user.42"}))
        .await;
    tab_b.next_named("order.shipped").await;

    let ack = json!({
        "event": "client-ack",
        "channel": "user.42",
        "data": {
            "notification_id": notification_id,
            "message_id": "m-1",
            "user_id": 42
        }
    });
    tokio::join!(tab_a.send(ack.clone()), tab_b.send(ack));

    let store = state.dispatcher.store();
    let row = store.get_delivery("42", &notification_id).unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert!(store.pending_for("42").is_empty());

    // Nothing left to redeliver for a later reconnect.
    assert_eq!(state.dispatcher.redeliver_pending("42"), 0);

    record_server.verify().await;
}

#[tokio::test]
async fn acknowledgement_confirmation_reaches_other_tabs_only() {
    let auth_server = authority().await;
    let state = state(&auth_server.uri(), None);

    let response = trigger(
        &state,
        json!({
            "channel": "user.42",
            "event": "invoice.ready",
            "data": {"message": "Invoice ready"}
        }),
    )
    .await;
    let notification_id = response["notification_id"].as_str().unwrap().to_string();

    let mut tab_a = Client::open(&state, "tok-42", ActorType::User);
    let mut tab_b = Client::open(&state, "tok-42", ActorType::User);
    for tab in [&mut tab_a, &mut tab_b] {
        tab.send(json!({"event": "subscribe", "channel": "user.42"}))
            .await;
    }

    tab_a
        .send(json!({
            "event": "client-ack",
            "channel": "user.42",
            "data": {"notificationId": notification_id, "userId": "42"}
        }))
        .await;

    let confirmation = tab_b.next_named("NewMessage").await;
    assert_eq!(confirmation.channel.as_deref(), Some("user.42"));
    assert_eq!(confirmation.data["messageId"], json!(notification_id));
    assert_eq!(confirmation.data["status"], json!("DELIVERED"));
}

// ============================================================================
// Actor type enforcement
// ============================================================================

#[tokio::test]
async fn cached_worker_token_presented_as_user_is_refused() {
    let auth_server = authority().await;
    mount_worker(&auth_server, 1).await;
    let state = state(&auth_server.uri(), None);

    let mut worker = Client::open(&state, "tok-w9", ActorType::Worker);
    worker
        .send(json!({"event": "subscribe", "channel": "worker.9"}))
        .await;
    assert_eq!(worker.next().await.event, EVENT_SUBSCRIPTION_SUCCEEDED);

    let mut impostor = Client::open(&state, "tok-w9", ActorType::User);
    impostor
        .send(json!({"event": "subscribe", "channel": "lobby"}))
        .await;
    let frame = impostor.next().await;
    assert_eq!(frame.event, EVENT_SUBSCRIPTION_ERROR);
    assert_eq!(frame.data["code"], json!(401));
    assert!(!impostor.connection.is_joined("lobby"));

    auth_server.verify().await;
}

#[tokio::test]
async fn worker_cannot_join_user_channel() {
    let auth_server = authority().await;
    mount_worker(&auth_server, 0).await;
    let state = state(&auth_server.uri(), None);

    let mut worker = Client::open(&state, "tok-w9", ActorType::Worker);
    worker
        .send(json!({"event": "subscribe", "channel": "user.42"}))
        .await;

    let frame = worker.next().await;
    assert_eq!(frame.event, EVENT_SUBSCRIPTION_ERROR);
    assert_eq!(frame.data["code"], json!(403));

    auth_server.verify().await;
}

#[tokio::test]
async fn join_authorization_endpoint_matches_socket_decisions() {
    let auth_server = authority().await;
    mount_worker(&auth_server, 1).await;
    let state = state(&auth_server.uri(), None);
    let app = create_router(state);

    let request = |token: &str, actor: &str, channel: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/broadcasting/auth")
            .header("access-token", token)
            .header("session-id", "s1")
            .header("x-actor-type", actor)
            .body(Body::from(json!({"channel_name": channel}).to_string()))
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(request("tok-w9", "worker", "worker.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request("tok-w9", "worker", "user.42"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(request("tok-w9", "user", "lobby"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    auth_server.verify().await;
}
