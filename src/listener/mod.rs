//! Streaming session lifecycle.
//!
//! [`StreamingSessionManager::start`] turns configuration into one live
//! streaming session: token, endpoint, handshake, standing observers and a
//! subscription to the configured channel. The session is started at most
//! once at a time; concurrent callers share the in-flight attempt, and a
//! failed attempt leaves the manager ready to try again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::auth::{TokenClient, TokenError};
use crate::config::{ConfigError, ConfigSource};
use crate::stream::endpoint::salesforce_transport_config;
use crate::stream::long_polling::LongPollingFactory;
use crate::stream::proto::{BayeuxMessage, META_CONNECT, META_DISCONNECT, META_HANDSHAKE};
use crate::stream::transport::{
    Subscription, Transport, TransportError, TransportException, TransportFactory,
};

mod logger;
mod state;

pub use logger::{ListenerLogger, TracingLogger};
pub use state::{SessionRegistry, SessionState, SessionStatus};

use state::{AttemptResult, AttemptSender, Claim};

/// Fatal startup errors, shared by every caller awaiting the attempt.
#[derive(Clone, Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Salesforce CometD handshake failed: {}", handshake_reason(.reply))]
    Handshake { reply: Box<BayeuxMessage> },

    #[error("startup attempt aborted: {0}")]
    Aborted(String),
}

impl ListenerError {
    /// True for errors caused by local configuration rather than upstream.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Token(TokenError::InvalidBaseUrl { .. })
                | Self::Token(TokenError::IncompleteResponse)
                | Self::Transport(TransportError::InvalidHeader { .. })
                | Self::Transport(TransportError::UnsupportedConnectionType(_))
        )
    }
}

fn handshake_reason(reply: &BayeuxMessage) -> &str {
    reply.error.as_deref().unwrap_or("unsuccessful reply")
}

fn connect_reason(reply: &BayeuxMessage) -> &str {
    reply.error.as_deref().unwrap_or("unsuccessful")
}

fn exception_reason(exception: &TransportException) -> &str {
    &exception.reason
}

/// Failures after the handshake. These are logged and never end the session.
#[derive(Clone, Debug, Error)]
pub enum ListenerRuntimeError {
    #[error("connect acknowledgement reported failure: {}", connect_reason(.reply))]
    ConnectFailed { reply: Box<BayeuxMessage> },

    #[error("transport exception: {}", exception_reason(.exception))]
    Exception { exception: TransportException },

    #[error("subscription to {channel} failed: {source}")]
    Subscribe {
        channel: String,
        source: TransportError,
    },
}

/// Handle to the live streaming session.
///
/// Handles are cheap to clone; two handles are equal when they refer to the
/// same session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    channel: String,
    endpoint: String,
    handshake: BayeuxMessage,
    transport: Arc<dyn Transport>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Channel this session subscribed to.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Streaming endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Client id currently assigned by the server.
    ///
    /// This changes if the transport has to re-handshake.
    pub fn client_id(&self) -> Option<String> {
        self.inner.transport.client_id()
    }

    /// Reply to the handshake that established this session.
    pub fn handshake_reply(&self) -> &BayeuxMessage {
        &self.inner.handshake
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

/// Starts and owns the process-wide streaming session.
#[derive(Clone)]
pub struct StreamingSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Arc<dyn ConfigSource>,
    tokens: TokenClient,
    transports: Arc<dyn TransportFactory>,
    registry: SessionRegistry,
    default_logger: Arc<dyn ListenerLogger>,
    next_session_id: AtomicU64,
}

impl StreamingSessionManager {
    /// Creates a manager using the default token client and the long-polling
    /// transport.
    pub fn new(config: Arc<dyn ConfigSource>) -> Result<Self, ListenerError> {
        Ok(Self::with_components(
            config,
            TokenClient::new()?,
            Arc::new(LongPollingFactory::default()),
        ))
    }

    pub fn with_components(
        config: Arc<dyn ConfigSource>,
        tokens: TokenClient,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                tokens,
                transports,
                registry: SessionRegistry::new(),
                default_logger: Arc::new(TracingLogger),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.registry.status().await
    }

    /// Starts the listener, or joins the session or attempt already underway.
    ///
    /// Returns `Ok(None)` when the listener is disabled or has no channel
    /// configured. Without a `logger` the [`TracingLogger`] is used.
    pub async fn start(
        &self,
        logger: Option<Arc<dyn ListenerLogger>>,
    ) -> Result<Option<SessionHandle>, ListenerError> {
        let logger = logger.unwrap_or_else(|| Arc::clone(&self.inner.default_logger));
        let listener = self.inner.config.listener();

        if !listener.enabled {
            return Ok(None);
        }

        let Some(channel) = listener.channel else {
            logger.warn(
                "Salesforce listener is enabled but no channel is configured; skipping subscription",
                json!({}),
            );
            return Ok(None);
        };

        let receiver = match self.inner.registry.claim().await {
            Claim::Connected(handle) => return Ok(Some(handle)),
            Claim::Attach(receiver) => receiver,
            Claim::Begin(sender, receiver) => {
                self.spawn_attempt(sender, logger, channel, listener.api_version);
                receiver
            }
        };

        SessionRegistry::wait(receiver).await.map(Some)
    }

    /// Runs the attempt on its own task so it completes even if every caller
    /// stops waiting.
    fn spawn_attempt(
        &self,
        sender: AttemptSender,
        logger: Arc<dyn ListenerLogger>,
        channel: String,
        api_version: Option<String>,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let attempt = tokio::spawn(run_attempt(
                Arc::clone(&inner),
                logger,
                channel,
                api_version,
            ));
            let result = match attempt.await {
                Ok(result) => result,
                Err(err) => Err(ListenerError::Aborted(err.to_string())),
            };
            if let Err(err) = &result {
                debug!(event = "listener_start_failed", error = %err);
            }
            inner.registry.complete(sender, result).await;
        });
    }
}

async fn run_attempt(
    inner: Arc<ManagerInner>,
    logger: Arc<dyn ListenerLogger>,
    channel: String,
    api_version: Option<String>,
) -> AttemptResult {
    let credentials = inner.config.credentials()?;
    let token = inner.tokens.acquire_token(&credentials).await?;

    let transport_config = salesforce_transport_config(&token, api_version.as_deref());
    let endpoint = transport_config.url.clone();
    let transport = inner.transports.create(transport_config)?;

    let reply = match transport.handshake().await {
        Ok(reply) => reply,
        Err(err) => unanswered_handshake(&err),
    };
    if !reply.is_successful() {
        return Err(ListenerError::Handshake {
            reply: Box::new(reply),
        });
    }

    logger.info(
        "Salesforce listener connected",
        json!({ "handshake": reply.to_value(), "channel": channel }),
    );

    spawn_observers(transport.as_ref(), &logger);

    match transport.subscribe(&channel).await {
        Ok(subscription) => spawn_message_logger(subscription, Arc::clone(&logger)),
        Err(source) => {
            let err = ListenerRuntimeError::Subscribe {
                channel: channel.clone(),
                source,
            };
            logger.error(
                "Salesforce listener subscription failed",
                json!({ "err": err.to_string(), "channel": channel }),
            );
        }
    }

    Ok(SessionHandle {
        inner: Arc::new(SessionInner {
            id: inner.next_session_id.fetch_add(1, Ordering::Relaxed),
            channel,
            endpoint,
            handshake: reply,
            transport,
        }),
    })
}

/// Stands in for the reply when the handshake request itself failed, such as
/// an HTTP 401 from the streaming endpoint.
fn unanswered_handshake(err: &TransportError) -> BayeuxMessage {
    let request = BayeuxMessage {
        channel: META_HANDSHAKE.to_string(),
        ..BayeuxMessage::default()
    };
    let mut reply = BayeuxMessage::failed_reply(&request, err.to_string());
    reply.error = Some(err.to_string());
    reply
}

fn spawn_observers(transport: &dyn Transport, logger: &Arc<dyn ListenerLogger>) {
    let mut disconnects = transport.add_listener(META_DISCONNECT);
    let log = Arc::clone(logger);
    tokio::spawn(async move {
        while let Some(message) = disconnects.recv().await {
            log.warn(
                "Salesforce listener disconnected",
                json!({ "message": message.to_value() }),
            );
        }
    });

    let mut connects = transport.add_listener(META_CONNECT);
    let log = Arc::clone(logger);
    tokio::spawn(async move {
        while let Some(message) = connects.recv().await {
            if message.is_successful() {
                continue;
            }
            let fields = json!({ "message": message.to_value() });
            let err = ListenerRuntimeError::ConnectFailed {
                reply: Box::new(message),
            };
            log.error(
                "Salesforce listener connect error",
                with_error(fields, &err),
            );
        }
    });

    let mut exceptions = transport.exceptions();
    let log = Arc::clone(logger);
    tokio::spawn(async move {
        while let Some(exception) = exceptions.recv().await {
            let fields = json!({
                "channel": exception.channel,
                "message": exception.message.as_ref().map(BayeuxMessage::to_value),
            });
            let err = ListenerRuntimeError::Exception { exception };
            log.error("Salesforce listener exception", with_error(fields, &err));
        }
    });
}

fn spawn_message_logger(mut subscription: Subscription, logger: Arc<dyn ListenerLogger>) {
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            logger.info(
                "Event received and processed",
                json!({ "channel": subscription.channel(), "message": message.to_value() }),
            );
        }
    });
}

fn with_error(mut fields: Value, err: &ListenerRuntimeError) -> Value {
    if let Value::Object(map) = &mut fields {
        map.insert("err".to_string(), Value::String(err.to_string()));
    }
    fields
}
