//! Transport abstraction used by the session manager.
//!
//! A [`Transport`] speaks Bayeux to one endpoint. Standing observers are plain
//! channel receivers: meta listeners, data subscriptions and transport
//! exceptions are all delivered on the transport's own tasks.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::proto::BayeuxMessage;

/// Bayeux connection types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    LongPolling,
    CallbackPolling,
    WebSocket,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LongPolling => "long-polling",
            Self::CallbackPolling => "callback-polling",
            Self::WebSocket => "websocket",
        }
    }
}

/// Endpoint and request settings for a transport instance.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    /// Headers sent with every transport request.
    pub headers: Vec<(String, SecretString)>,
    /// Appends the meta message type (`handshake`, `connect`, ...) to the URL.
    pub append_message_type_to_url: bool,
    /// Registered connection types in preference order.
    pub connection_types: Vec<ConnectionType>,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            append_message_type_to_url: true,
            connection_types: vec![
                ConnectionType::WebSocket,
                ConnectionType::LongPolling,
                ConnectionType::CallbackPolling,
            ],
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: SecretString) -> Self {
        self.headers.push((name.into(), value));
        self
    }

    pub fn with_append_message_type_to_url(mut self, append: bool) -> Self {
        self.append_message_type_to_url = append;
        self
    }

    pub fn with_connection_types(mut self, connection_types: Vec<ConnectionType>) -> Self {
        self.connection_types = connection_types;
        self
    }

    pub fn allows(&self, connection_type: ConnectionType) -> bool {
        self.connection_types.contains(&connection_type)
    }
}

/// Messages delivered for one subscribed channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    messages: mpsc::UnboundedReceiver<BayeuxMessage>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: mpsc::UnboundedReceiver<BayeuxMessage>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receives the next message; `None` once the transport drops the channel.
    pub async fn recv(&mut self) -> Option<BayeuxMessage> {
        self.messages.recv().await
    }
}

/// Non-fatal failure observed by the transport after the handshake.
#[derive(Clone, Debug)]
pub struct TransportException {
    pub reason: String,
    pub channel: Option<String>,
    pub message: Option<BayeuxMessage>,
}

impl TransportException {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            channel: None,
            message: None,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_message(mut self, message: BayeuxMessage) -> Self {
        self.message = Some(message);
        self
    }
}

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("invalid bayeux payload: {0}")]
    Json(String),

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("connection type {0} is not registered")]
    UnsupportedConnectionType(&'static str),

    #[error("no {channel} reply in server response")]
    MissingReply { channel: String },

    #[error("transport has no client id; handshake first")]
    NotHandshaken,

    #[error("{channel} rejected: {reason}")]
    Rejected {
        channel: String,
        reason: String,
        reply: Box<BayeuxMessage>,
    },
}

impl TransportError {
    pub fn rejected(reply: BayeuxMessage) -> Self {
        Self::Rejected {
            channel: reply.channel.clone(),
            reason: reply
                .error
                .clone()
                .unwrap_or_else(|| "unsuccessful".to_string()),
            reply: Box::new(reply),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

/// Long-lived Bayeux client bound to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the handshake and, when it succeeds, starts the connect loop.
    ///
    /// Any server reply is returned as `Ok`, successful or not; `Err` means
    /// no reply could be obtained.
    async fn handshake(&self) -> Result<BayeuxMessage, TransportError>;

    /// Subscribes to a data channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    /// Sends `/meta/disconnect` and stops the connect loop.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Registers an observer for a meta channel (or channel pattern).
    fn add_listener(&self, channel: &str) -> mpsc::UnboundedReceiver<BayeuxMessage>;

    /// Registers an observer for transport exceptions.
    fn exceptions(&self) -> mpsc::UnboundedReceiver<TransportException>;

    /// Client id assigned by the last successful handshake.
    fn client_id(&self) -> Option<String>;
}

/// Creates a fresh transport for each startup attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: TransportConfig) -> Result<Arc<dyn Transport>, TransportError>;
}
