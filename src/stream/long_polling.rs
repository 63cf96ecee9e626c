//! HTTP long-polling Bayeux transport.
//!
//! After a successful handshake a background worker keeps one `/meta/connect`
//! request outstanding at all times, dispatches every message the server
//! returns, and follows the server's reconnect advice. Transport failures are
//! reported to exception observers and retried with [`ReconnectPolicy`]; the
//! worker re-handshakes and re-subscribes when the server asks for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::proto::{
    channel_matches, meta_type, Advice, BayeuxMessage, Reconnect, META_CONNECT, META_DISCONNECT,
    META_HANDSHAKE,
};
use crate::stream::transport::{
    ConnectionType, Subscription, Transport, TransportConfig, TransportError, TransportException,
    TransportFactory,
};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Server hold time assumed until the server advises otherwise.
const DEFAULT_SERVER_TIMEOUT_MS: u64 = 110_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LongPollingDefaults;

impl LongPollingDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_NETWORK_DELAY: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct LongPollingOptions {
    /// TCP connect timeout for every request.
    pub connect_timeout: Duration,
    /// Budget for a request beyond the server's advised hold time.
    pub max_network_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for LongPollingOptions {
    fn default() -> Self {
        Self {
            connect_timeout: LongPollingDefaults::CONNECT_TIMEOUT,
            max_network_delay: LongPollingDefaults::MAX_NETWORK_DELAY,
            reconnect: ReconnectPolicy::long_polling(),
        }
    }
}

/// Builds a [`LongPollingTransport`] per startup attempt.
#[derive(Clone, Debug, Default)]
pub struct LongPollingFactory {
    options: LongPollingOptions,
}

impl LongPollingFactory {
    pub fn new(options: LongPollingOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for LongPollingFactory {
    fn create(&self, config: TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = LongPollingTransport::new(config, self.options.clone())?;
        Ok(Arc::new(transport))
    }
}

pub struct LongPollingTransport {
    shared: Arc<Shared>,
}

impl LongPollingTransport {
    pub fn new(config: TransportConfig, options: LongPollingOptions) -> Result<Self, TransportError> {
        if !config.allows(ConnectionType::LongPolling) {
            return Err(TransportError::UnsupportedConnectionType(
                ConnectionType::LongPolling.as_str(),
            ));
        }

        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .cookie_store(true)
            .default_headers(header_map(&config)?)
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared {
                http,
                url: config.url,
                append_message_type_to_url: config.append_message_type_to_url,
                options,
                next_id: AtomicU64::new(1),
                client_id: RwLock::new(None),
                advice: RwLock::new(Advice::default()),
                listeners: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                exceptions: Mutex::new(Vec::new()),
                worker: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    async fn handshake(&self) -> Result<BayeuxMessage, TransportError> {
        let reply = self.shared.handshake().await?;
        if reply.is_successful() {
            Shared::start_worker(&self.shared);
        }
        Ok(reply)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before sending so events batched with the reply are kept.
        lock(&self.shared.subscriptions, "subscriptions").push((channel.to_string(), tx.clone()));

        if let Err(err) = self.shared.send_subscribe(channel).await {
            lock(&self.shared.subscriptions, "subscriptions")
                .retain(|(_, sender)| !sender.same_channel(&tx));
            return Err(err);
        }
        Ok(Subscription::new(channel, rx))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.stop_worker();
        let Some(client_id) = self.shared.take_client_id() else {
            return Ok(());
        };

        let request = BayeuxMessage::disconnect(self.shared.next_message_id(), client_id);
        let reply = match self
            .shared
            .exchange(&request, self.shared.options.max_network_delay)
            .await
        {
            Ok(reply) => reply,
            Err(err) => BayeuxMessage::failed_reply(&request, err.to_string()),
        };
        self.shared.dispatch(reply);
        Ok(())
    }

    fn add_listener(&self, channel: &str) -> mpsc::UnboundedReceiver<BayeuxMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.listeners, "listeners").push((channel.to_string(), tx));
        rx
    }

    fn exceptions(&self) -> mpsc::UnboundedReceiver<TransportException> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.exceptions, "exceptions").push(tx);
        rx
    }

    fn client_id(&self) -> Option<String> {
        self.shared.client_id()
    }
}

type Observers<T> = Mutex<Vec<(String, mpsc::UnboundedSender<T>)>>;

struct Shared {
    http: Client,
    url: String,
    append_message_type_to_url: bool,
    options: LongPollingOptions,
    next_id: AtomicU64,
    client_id: RwLock<Option<String>>,
    advice: RwLock<Advice>,
    listeners: Observers<BayeuxMessage>,
    subscriptions: Observers<BayeuxMessage>,
    exceptions: Mutex<Vec<mpsc::UnboundedSender<TransportException>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn next_message_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn client_id(&self) -> Option<String> {
        read(&self.client_id, "client_id").clone()
    }

    fn take_client_id(&self) -> Option<String> {
        write(&self.client_id, "client_id").take()
    }

    fn set_client_id(&self, client_id: Option<String>) {
        *write(&self.client_id, "client_id") = client_id;
    }

    fn update_advice(&self, advice: Option<&Advice>) {
        let Some(advice) = advice else {
            return;
        };
        let mut current = write(&self.advice, "advice");
        if advice.reconnect.is_some() {
            current.reconnect = advice.reconnect;
        }
        if advice.interval.is_some() {
            current.interval = advice.interval;
        }
        if advice.timeout.is_some() {
            current.timeout = advice.timeout;
        }
    }

    fn current_advice(&self) -> Advice {
        read(&self.advice, "advice").clone()
    }

    fn endpoint_for(&self, message: &BayeuxMessage) -> String {
        match meta_type(&message.channel) {
            Some(kind) if self.append_message_type_to_url => {
                let separator = if self.url.ends_with('/') { "" } else { "/" };
                format!("{}{separator}{kind}", self.url)
            }
            _ => self.url.clone(),
        }
    }

    async fn send(
        &self,
        message: &BayeuxMessage,
        timeout: Duration,
    ) -> Result<Vec<BayeuxMessage>, TransportError> {
        let endpoint = self.endpoint_for(message);
        let response = self
            .http
            .post(&endpoint)
            .timeout(timeout)
            .json(&[message])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_replies(&body)
    }

    /// Sends one message and returns the reply on the same channel.
    ///
    /// Any other messages in the response are dispatched to observers.
    async fn exchange(
        &self,
        request: &BayeuxMessage,
        timeout: Duration,
    ) -> Result<BayeuxMessage, TransportError> {
        let mut reply = None;
        for message in self.send(request, timeout).await? {
            if reply.is_none() && message.channel == request.channel {
                reply = Some(message);
            } else {
                self.dispatch(message);
            }
        }

        reply.ok_or_else(|| TransportError::MissingReply {
            channel: request.channel.clone(),
        })
    }

    async fn handshake(&self) -> Result<BayeuxMessage, TransportError> {
        let request = BayeuxMessage::handshake(
            self.next_message_id(),
            vec![ConnectionType::LongPolling.as_str().to_string()],
        );
        let mut reply = self
            .exchange(&request, self.options.max_network_delay)
            .await?;
        self.update_advice(reply.advice.as_ref());

        if reply.is_successful() {
            let negotiated = reply
                .supported_connection_types
                .as_ref()
                .map_or(true, |types| {
                    types
                        .iter()
                        .any(|kind| kind == ConnectionType::LongPolling.as_str())
                });

            match reply.client_id.clone() {
                Some(client_id) if negotiated => self.set_client_id(Some(client_id)),
                Some(_) => {
                    reply.successful = Some(false);
                    reply.error = Some("no common connection type".to_string());
                }
                None => {
                    reply.successful = Some(false);
                    reply.error = Some("handshake reply carried no clientId".to_string());
                }
            }
        }

        self.dispatch(reply.clone());
        Ok(reply)
    }

    async fn send_subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let client_id = self.client_id().ok_or(TransportError::NotHandshaken)?;
        let request = BayeuxMessage::subscribe(self.next_message_id(), client_id, channel);
        let reply = self
            .exchange(&request, self.options.max_network_delay)
            .await?;
        self.dispatch(reply.clone());

        if !reply.is_successful() {
            return Err(TransportError::rejected(reply));
        }
        Ok(())
    }

    async fn resubscribe(&self) {
        let mut channels: Vec<String> = lock(&self.subscriptions, "subscriptions")
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.dedup();

        for channel in channels {
            if let Err(err) = self.send_subscribe(&channel).await {
                self.raise(
                    TransportException::new(format!("resubscribe failed: {err}"))
                        .on_channel(channel),
                );
            }
        }
    }

    fn dispatch(&self, message: BayeuxMessage) {
        let observers = if message.is_meta() {
            &self.listeners
        } else {
            &self.subscriptions
        };

        lock(observers, "observers").retain(|(pattern, tx)| {
            if !channel_matches(pattern, &message.channel) {
                return !tx.is_closed();
            }
            tx.send(message.clone()).is_ok()
        });
    }

    fn raise(&self, exception: TransportException) {
        warn!(
            event = "transport_exception",
            reason = %exception.reason,
            channel = exception.channel.as_deref().unwrap_or("")
        );
        lock(&self.exceptions, "exceptions").retain(|tx| tx.send(exception.clone()).is_ok());
    }

    fn start_worker(shared: &Arc<Shared>) {
        let mut worker = lock(&shared.worker, "worker");
        if worker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let shared = Arc::clone(shared);
        *worker = Some(tokio::spawn(async move {
            connect_worker(shared).await;
        }));
    }

    fn stop_worker(&self) {
        let task = lock(&self.worker, "worker").take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn connect_timeout(&self) -> Duration {
        let server_timeout = self
            .current_advice()
            .timeout
            .unwrap_or(DEFAULT_SERVER_TIMEOUT_MS);
        Duration::from_millis(server_timeout) + self.options.max_network_delay
    }
}

enum Recovery {
    Continue,
    Stop,
}

async fn connect_worker(shared: Arc<Shared>) {
    let mut failures = 0usize;
    let mut first_connect = true;

    loop {
        let Some(client_id) = shared.client_id() else {
            break;
        };

        let mut request = BayeuxMessage::connect(
            shared.next_message_id(),
            client_id,
            ConnectionType::LongPolling.as_str(),
        );
        if first_connect {
            // The first connect returns immediately so the session is
            // established before long polling starts.
            request.advice = Some(Advice {
                timeout: Some(0),
                ..Advice::default()
            });
            first_connect = false;
        }

        let reply = match shared.exchange(&request, shared.connect_timeout()).await {
            Ok(reply) => reply,
            Err(err) => {
                shared.raise(
                    TransportException::new(err.to_string())
                        .on_channel(META_CONNECT)
                        .with_message(request.clone()),
                );
                BayeuxMessage::failed_reply(&request, err.to_string())
            }
        };
        shared.update_advice(reply.advice.as_ref());
        let advice = reply.reconnect_advice();
        let successful = reply.is_successful();
        shared.dispatch(reply);

        if successful {
            failures = 0;
            let interval = shared.current_advice().interval.unwrap_or(0);
            if interval > 0 {
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
            continue;
        }

        failures += 1;
        let recovery = match advice.unwrap_or(Reconnect::Retry) {
            Reconnect::Retry => {
                shared.options.reconnect.wait(failures).await;
                Recovery::Continue
            }
            Reconnect::Handshake => {
                shared.set_client_id(None);
                let recovery = rehandshake(&shared, &mut failures).await;
                first_connect = true;
                recovery
            }
            Reconnect::None => Recovery::Stop,
        };

        if let Recovery::Stop = recovery {
            debug!(event = "connect_worker_stopped", failures);
            let client_id = shared.take_client_id();
            shared.dispatch(BayeuxMessage {
                channel: META_DISCONNECT.to_string(),
                client_id,
                successful: Some(true),
                ..BayeuxMessage::default()
            });
            break;
        }
    }
}

async fn rehandshake(shared: &Arc<Shared>, failures: &mut usize) -> Recovery {
    loop {
        shared.options.reconnect.wait(*failures).await;

        match shared.handshake().await {
            Ok(reply) if reply.is_successful() => {
                debug!(event = "rehandshake_ok", client_id = ?reply.client_id);
                shared.resubscribe().await;
                *failures = 0;
                return Recovery::Continue;
            }
            Ok(reply) => {
                if reply.reconnect_advice() == Some(Reconnect::None) {
                    return Recovery::Stop;
                }
                shared.raise(
                    TransportException::new("re-handshake rejected")
                        .on_channel(META_HANDSHAKE)
                        .with_message(reply),
                );
            }
            Err(err) => {
                shared.raise(TransportException::new(err.to_string()).on_channel(META_HANDSHAKE));
            }
        }

        *failures += 1;
    }
}

// Observer lists and session fields stay consistent across a panic, so a
// poisoned lock is recovered rather than skipped.
fn lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!(event = "lock_poisoned", lock = name);
        poisoned.into_inner()
    })
}

fn read<'a, T>(rw: &'a RwLock<T>, name: &'static str) -> RwLockReadGuard<'a, T> {
    rw.read().unwrap_or_else(|poisoned| {
        warn!(event = "lock_poisoned", lock = name);
        poisoned.into_inner()
    })
}

fn write<'a, T>(rw: &'a RwLock<T>, name: &'static str) -> RwLockWriteGuard<'a, T> {
    rw.write().unwrap_or_else(|poisoned| {
        warn!(event = "lock_poisoned", lock = name);
        poisoned.into_inner()
    })
}

fn header_map(config: &TransportConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let invalid = |reason: String| TransportError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| invalid(err.to_string()))?;
        let mut header_value =
            HeaderValue::from_str(value.expose_secret()).map_err(|err| invalid(err.to_string()))?;
        header_value.set_sensitive(true);
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn parse_replies(body: &str) -> Result<Vec<BayeuxMessage>, TransportError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Replies {
        Batch(Vec<BayeuxMessage>),
        Single(BayeuxMessage),
    }

    match serde_json::from_str::<Replies>(body) {
        Ok(Replies::Batch(messages)) => Ok(messages),
        Ok(Replies::Single(message)) => Ok(vec![message]),
        Err(err) => Err(TransportError::Json(err.to_string())),
    }
}

fn summarize_error_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
