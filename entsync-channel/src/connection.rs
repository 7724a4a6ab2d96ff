//! WebSocket channel client: one socket, many topics.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with idempotent connect
//! - Topic join with a reply timeout
//! - Request/acknowledge pushes correlated by `ref`
//! - Inbound broadcast subscriptions per (topic, event)
//! - Periodic heartbeat
//!
//! ```text
//!  ChannelHandle::push ──► outgoing mpsc ──► writer task ──► socket
//!                     ▲
//!       oneshot reply │          ┌── phx_reply → pending[ref]
//!  socket ──► reader task ──► dispatch
//!                                └── broadcast → handlers[(topic, event)]
//! ```
//!
//! A `Connection` is built once per session and shared by reference
//! (`Arc<Connection>`) with every store that syncs through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use entsync_core::protocol::ProtocolError;

use crate::frame::{Frame, Reply, ReplyStatus, JOIN_EVENT, LEAVE_EVENT, REPLY_EVENT};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the sync backend
    pub url: String,
    /// How long to wait for a `phx_join` reply
    pub join_timeout: Duration,
    /// How long to wait for a push reply
    pub push_timeout: Duration,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Buffered broadcasts per subscriber before the reader waits
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            join_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Channel errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("Timed out waiting for reply")]
    Timeout,
    #[error("Failed to join topic '{topic}': {reason}")]
    JoinFailed { topic: String, reason: String },
    #[error("Push rejected: {0}")]
    Rejected(Value),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type Subscribers = HashMap<(String, String), Vec<mpsc::Sender<Value>>>;

/// State shared between the connection, its handles and the I/O tasks.
struct Shared {
    state: RwLock<ConnectionState>,
    outgoing: RwLock<Option<mpsc::Sender<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    subscribers: RwLock<Subscribers>,
    /// topic → join_ref
    joined: RwLock<HashMap<String, String>>,
    next_ref: AtomicU64,
    event_buffer: usize,
}

impl Shared {
    fn new(event_buffer: usize) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            outgoing: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            joined: RwLock::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
            event_buffer,
        }
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let tx = self
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(ChannelError::Disconnected)?;
        let text = frame.encode()?;
        tx.send(text).await.map_err(|_| ChannelError::Disconnected)
    }

    /// Send a frame with a fresh ref and wait for its reply.
    async fn request(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
        join_ref: Option<String>,
        wait: Duration,
    ) -> Result<Value, ChannelError> {
        let reference = self.make_ref();
        self.request_with_ref(reference, topic, event, payload, join_ref, wait)
            .await
    }

    async fn request_with_ref(
        &self,
        reference: String,
        topic: &str,
        event: &str,
        payload: Value,
        join_ref: Option<String>,
        wait: Duration,
    ) -> Result<Value, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(reference.clone(), reply_tx);

        let frame = Frame::push(topic, event, payload, reference.clone(), join_ref);
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.lock().await.remove(&reference);
            return Err(e);
        }

        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(reply)) => match reply.status {
                ReplyStatus::Ok => Ok(reply.response),
                ReplyStatus::Error => Err(ChannelError::Rejected(reply.response)),
            },
            Ok(Err(_)) => Err(ChannelError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&reference);
                log::warn!("No reply to '{event}' on '{topic}' within {wait:?}");
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Route an inbound frame to a waiting push or to topic subscribers.
    async fn dispatch(&self, frame: Frame) {
        if frame.event == REPLY_EVENT {
            let Some(reference) = frame.reference.as_ref() else {
                log::debug!("Reply without ref on '{}'", frame.topic);
                return;
            };
            let waiter = self.pending.lock().await.remove(reference);
            match (waiter, frame.as_reply()) {
                (Some(tx), Some(reply)) => {
                    let _ = tx.send(reply);
                }
                (Some(_), None) => log::warn!("Malformed reply for ref {reference}"),
                (None, _) => log::trace!("Unclaimed reply for ref {reference}"),
            }
            return;
        }

        // No lock is held across sends.
        let key = (frame.topic.clone(), frame.event.clone());
        let targets = match self.subscribers.read().await.get(&key) {
            Some(senders) => senders.clone(),
            None => {
                log::trace!("No subscribers for '{}' on '{}'", frame.event, frame.topic);
                return;
            }
        };

        let mut closed = false;
        for tx in &targets {
            if tx.send(frame.payload.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            if let Some(senders) = self.subscribers.write().await.get_mut(&key) {
                senders.retain(|tx| !tx.is_closed());
            }
        }
    }

    /// Drop the socket side: fail outstanding pushes and forget joins.
    async fn teardown(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
        *self.outgoing.write().await = None;
        self.pending.lock().await.clear();
        self.joined.write().await.clear();
    }

    async fn subscribe(&self, topic: &str, event: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        self.subscribers
            .write()
            .await
            .entry((topic.to_string(), event.to_string()))
            .or_default()
            .push(tx);
        rx
    }
}

/// Handle to a joined topic.
///
/// Cheap to clone; every clone pushes through the same socket.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
    topic: String,
    join_ref: String,
    push_timeout: Duration,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.topic)
            .field("join_ref", &self.join_ref)
            .finish()
    }
}

impl ChannelHandle {
    /// Topic this handle was joined to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Push an event and wait for the `ok` response.
    ///
    /// An `error` reply becomes [`ChannelError::Rejected`].
    pub async fn push(&self, event: &str, payload: Value) -> Result<Value, ChannelError> {
        log::debug!("push '{event}' on '{}'", self.topic);
        self.shared
            .request(
                &self.topic,
                event,
                payload,
                Some(self.join_ref.clone()),
                self.push_timeout,
            )
            .await
    }

    /// Subscribe to inbound broadcasts of `event` on this topic.
    ///
    /// Dropping the receiver unsubscribes.
    pub async fn on(&self, event: &str) -> mpsc::Receiver<Value> {
        self.shared.subscribe(&self.topic, event).await
    }

    /// Leave the topic. Subscribers stay registered for a later rejoin.
    pub async fn leave(&self) -> Result<(), ChannelError> {
        let result = self
            .shared
            .request(
                &self.topic,
                LEAVE_EVENT,
                json!({}),
                Some(self.join_ref.clone()),
                self.push_timeout,
            )
            .await
            .map(|_| ());
        self.shared.joined.write().await.remove(&self.topic);
        result
    }
}

/// The session-wide channel connection.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    connect_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Create a disconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        let shared = Arc::new(Shared::new(config.event_buffer));
        Self {
            config,
            shared,
            connect_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create with default configuration pointed at `url`.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self::new(ConnectionConfig {
            url: url.into(),
            ..ConnectionConfig::default()
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Topics currently joined.
    pub async fn joined_topics(&self) -> Vec<String> {
        self.shared.joined.read().await.keys().cloned().collect()
    }

    /// Open the socket.
    ///
    /// Idempotent: returns immediately when already connected. A failure is
    /// logged and returned; the connection stays `Disconnected` and stores
    /// keep working locally.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let _guard = self.connect_lock.lock().await;
        if *self.shared.state.read().await == ConnectionState::Connected {
            return Ok(());
        }
        *self.shared.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::error!("Failed to connect to {}: {e}", self.config.url);
                return Err(ChannelError::Connect(e.to_string()));
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        *self.shared.outgoing.write().await = Some(out_tx);
        // Before the reader exists, so an early close cannot be overwritten.
        *self.shared.state.write().await = ConnectionState::Connected;

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());

        // Writer task: forward outgoing channel to WebSocket
        tasks.push(tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        // Reader task: decode frames and dispatch
        let shared = self.shared.clone();
        let url = self.config.url.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(frame) => shared.dispatch(frame).await,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            shared.teardown().await;
            log::info!("Disconnected from {url}");
        }));

        // Heartbeat task
        let shared = self.shared.clone();
        let period = self.config.heartbeat_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *shared.state.read().await != ConnectionState::Connected {
                    break;
                }
                let frame = Frame::heartbeat(shared.make_ref());
                if shared.send_frame(&frame).await.is_err() {
                    break;
                }
                log::trace!("heartbeat sent");
            }
        }));

        log::info!("Connected to {}", self.config.url);
        Ok(())
    }

    /// Join `topic` and return a handle for pushes and subscriptions.
    ///
    /// Fails loudly: an error reply, a timeout or a missing socket are all
    /// returned to the caller as setup errors.
    pub async fn join(&self, topic: &str) -> Result<ChannelHandle, ChannelError> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            return Err(ChannelError::JoinFailed {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            });
        }

        let join_ref = self.shared.make_ref();
        let result = self
            .shared
            .request_with_ref(
                join_ref.clone(),
                topic,
                JOIN_EVENT,
                json!({}),
                Some(join_ref.clone()),
                self.config.join_timeout,
            )
            .await;

        match result {
            Ok(_) => {
                self.shared
                    .joined
                    .write()
                    .await
                    .insert(topic.to_string(), join_ref.clone());
                log::info!("Joined topic '{topic}'");
                Ok(ChannelHandle {
                    shared: self.shared.clone(),
                    topic: topic.to_string(),
                    join_ref,
                    push_timeout: self.config.push_timeout,
                })
            }
            Err(ChannelError::Rejected(response)) => {
                let reason = response
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| response.to_string());
                log::error!("Join of '{topic}' rejected: {reason}");
                Err(ChannelError::JoinFailed {
                    topic: topic.to_string(),
                    reason,
                })
            }
            Err(e) => {
                log::error!("Join of '{topic}' failed: {e}");
                Err(e)
            }
        }
    }

    /// Close the socket and stop background tasks.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.shared.teardown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        log::info!("Connection to {} closed", self.config.url);
    }
}
