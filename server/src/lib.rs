//! Herald Server - Real-time notification and presence gateway.
//!
//! This crate provides the Herald gateway, responsible for:
//! - Resolving client credentials against an external authority, with a
//!   time-bounded identity cache in front of it
//! - Authorizing presence-channel joins by actor namespace
//! - Persisting notifications and per-recipient delivery state
//! - Emitting notifications and relaying client whispers in real time
//! - Recording delivery acknowledgements exactly once and forwarding them
//!
//! # Architecture
//!
//! Backend services trigger notifications over HTTP. Each trigger is stored
//! with one pending delivery row per recipient and then emitted on the
//! realtime bus. Clients connected over WebSocket join channels, receive
//! events, and acknowledge deliveries with `client-*` whispers. An
//! acknowledgement flips its delivery row from pending to delivered at most
//! once; only the acknowledgement that wins that transition is forwarded to
//! the system of record.

pub mod ack;
pub mod auth;
pub mod authority;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod identity;
pub mod resolver;
pub mod routes;
pub mod store;
pub mod types;
