//! Salesforce streaming listener.
//!
//! The crate is organized by concern:
//! - `config`: credentials and listener settings.
//! - `auth`: OAuth client-credentials token client.
//! - `rest`: customer creation over the REST data API.
//! - `stream`: Bayeux protocol types and the long-polling transport.
//! - `listener`: the streaming session manager.
//! - `retry`: reconnect backoff used by the transport.

/// OAuth token client.
pub mod auth;
/// Configuration sources.
pub mod config;
/// Streaming session manager.
pub mod listener;
/// REST data API client.
pub mod rest;
/// Reconnect backoff policy.
pub mod retry;
/// Streaming protocol and transport.
pub mod stream;

pub use listener::{
    ListenerError, ListenerLogger, SessionHandle, StreamingSessionManager, TracingLogger,
};
