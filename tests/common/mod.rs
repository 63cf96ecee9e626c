#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Form, Router};
use salesforce_listener::config::SalesforceSettings;
use salesforce_listener::stream::proto::{BayeuxMessage, META_HANDSHAKE};
use salesforce_listener::stream::transport::{
    Subscription, Transport, TransportConfig, TransportError, TransportException,
    TransportFactory,
};
use salesforce_listener::ListenerLogger;
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub const TEST_CHANNEL: &str = "/event/Customer__e";
pub const TEST_INSTANCE_URL: &str = "https://example.my.salesforce.com";

pub async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

/// Token endpoint behaviour and observations.
#[derive(Clone)]
pub struct TokenState {
    pub status: StatusCode,
    pub body: String,
    pub hits: Arc<AtomicUsize>,
    pub forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    pub form_encoded: Arc<AtomicBool>,
    pub delay: Duration,
}

impl TokenState {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            hits: Arc::new(AtomicUsize::new(0)),
            forms: Arc::new(Mutex::new(Vec::new())),
            form_encoded: Arc::new(AtomicBool::new(true)),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ok(instance_url: &str) -> Self {
        Self::new(
            StatusCode::OK,
            serde_json::json!({
                "access_token": "tok-123",
                "instance_url": instance_url,
                "token_type": "Bearer"
            })
            .to_string(),
        )
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub fn token_routes(state: TokenState) -> Router {
    Router::new()
        .route("/services/oauth2/token", post(token_handler))
        .with_state(state)
}

async fn token_handler(
    State(state): State<TokenState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let form_encoded = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if !form_encoded {
        state.form_encoded.store(false, Ordering::SeqCst);
    }
    state.forms.lock().expect("forms lock").push(form);
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    (state.status, state.body.clone())
}

pub fn settings(
    base_url: &str,
    enabled: bool,
    channel: Option<&str>,
    api_version: Option<&str>,
) -> SalesforceSettings {
    SalesforceSettings {
        base_url: Some(base_url.to_string()),
        client_id: Some("client-id".to_string()),
        client_secret: Some(SecretString::new("client-secret".to_string())),
        listener_enabled: enabled,
        streaming_channel: channel.map(str::to_string),
        api_version: api_version.map(str::to_string),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<(Level, String, Value)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<(Level, String, Value)> {
        self.entries.lock().expect("log lock").clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.entries()
            .iter()
            .filter(|(entry_level, _, _)| *entry_level == level)
            .count()
    }

    pub fn count_message(&self, level: Level, message: &str) -> usize {
        self.entries()
            .iter()
            .filter(|(entry_level, text, _)| *entry_level == level && text == message)
            .count()
    }

    pub fn find(&self, message: &str) -> Option<Value> {
        self.entries()
            .into_iter()
            .find(|(_, text, _)| text == message)
            .map(|(_, _, fields)| fields)
    }

    fn push(&self, level: Level, message: &str, fields: Value) {
        self.entries
            .lock()
            .expect("log lock")
            .push((level, message.to_string(), fields));
    }
}

impl ListenerLogger for RecordingLogger {
    fn info(&self, message: &str, fields: Value) {
        self.push(Level::Info, message, fields);
    }

    fn warn(&self, message: &str, fields: Value) {
        self.push(Level::Warn, message, fields);
    }

    fn error(&self, message: &str, fields: Value) {
        self.push(Level::Error, message, fields);
    }
}

pub fn sink(logger: &Arc<RecordingLogger>) -> Option<Arc<dyn ListenerLogger>> {
    Some(logger.clone())
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Transport factory that records every call and never touches the network.
pub struct FakeFactory {
    pub handshake_ok: AtomicBool,
    pub subscribe_ok: AtomicBool,
    pub handshake_delay: Duration,
    pub creates: AtomicUsize,
    pub handshakes: Arc<AtomicUsize>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub configs: Mutex<Vec<TransportConfig>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new(handshake_ok: bool, handshake_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            handshake_ok: AtomicBool::new(handshake_ok),
            subscribe_ok: AtomicBool::new(true),
            handshake_delay,
            creates: AtomicUsize::new(0),
            handshakes: Arc::new(AtomicUsize::new(0)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            configs: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().expect("subscriptions lock").clone()
    }

    pub fn last_config(&self) -> TransportConfig {
        self.configs
            .lock()
            .expect("configs lock")
            .last()
            .cloned()
            .expect("a transport was created")
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .expect("transports lock")
            .last()
            .cloned()
            .expect("a transport was created")
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, config: TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().expect("configs lock").push(config);

        let transport = Arc::new(FakeTransport {
            handshake_ok: self.handshake_ok.load(Ordering::SeqCst),
            subscribe_ok: self.subscribe_ok.load(Ordering::SeqCst),
            handshake_delay: self.handshake_delay,
            handshakes: Arc::clone(&self.handshakes),
            subscriptions: Arc::clone(&self.subscriptions),
            listeners: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
            data: Mutex::new(Vec::new()),
        });
        self.transports
            .lock()
            .expect("transports lock")
            .push(Arc::clone(&transport));

        let transport: Arc<dyn Transport> = transport;
        Ok(transport)
    }
}

pub struct FakeTransport {
    handshake_ok: bool,
    subscribe_ok: bool,
    handshake_delay: Duration,
    handshakes: Arc<AtomicUsize>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    listeners: Mutex<Vec<(String, mpsc::UnboundedSender<BayeuxMessage>)>>,
    exceptions: Mutex<Vec<mpsc::UnboundedSender<TransportException>>>,
    data: Mutex<Vec<(String, mpsc::UnboundedSender<BayeuxMessage>)>>,
}

impl FakeTransport {
    pub fn emit_meta(&self, message: BayeuxMessage) {
        for (channel, tx) in self.listeners.lock().expect("listeners lock").iter() {
            if *channel == message.channel {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub fn emit_data(&self, message: BayeuxMessage) {
        for (channel, tx) in self.data.lock().expect("data lock").iter() {
            if *channel == message.channel {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub fn raise(&self, exception: TransportException) {
        for tx in self.exceptions.lock().expect("exceptions lock").iter() {
            let _ = tx.send(exception.clone());
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn handshake(&self) -> Result<BayeuxMessage, TransportError> {
        tokio::time::sleep(self.handshake_delay).await;
        self.handshakes.fetch_add(1, Ordering::SeqCst);

        if self.handshake_ok {
            Ok(BayeuxMessage {
                channel: META_HANDSHAKE.to_string(),
                successful: Some(true),
                client_id: Some("fake-client".to_string()),
                ..BayeuxMessage::default()
            })
        } else {
            Ok(BayeuxMessage {
                channel: META_HANDSHAKE.to_string(),
                successful: Some(false),
                error: Some("403::Handshake denied".to_string()),
                ..BayeuxMessage::default()
            })
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .push(channel.to_string());

        if !self.subscribe_ok {
            return Err(TransportError::rejected(BayeuxMessage {
                channel: "/meta/subscribe".to_string(),
                successful: Some(false),
                subscription: Some(channel.to_string()),
                error: Some("403::Subscription denied".to_string()),
                ..BayeuxMessage::default()
            }));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.data
            .lock()
            .expect("data lock")
            .push((channel.to_string(), tx));
        Ok(Subscription::new(channel, rx))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn add_listener(&self, channel: &str) -> mpsc::UnboundedReceiver<BayeuxMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .expect("listeners lock")
            .push((channel.to_string(), tx));
        rx
    }

    fn exceptions(&self) -> mpsc::UnboundedReceiver<TransportException> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.exceptions.lock().expect("exceptions lock").push(tx);
        rx
    }

    fn client_id(&self) -> Option<String> {
        self.handshake_ok.then(|| "fake-client".to_string())
    }
}
