//! Reference sync backend: topic routing, version assignment and fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── entity versions (per id)
//!            ├── TopicGroup("Tags") ┤
//! Client B ──┘        │             └── group version
//!                     ▼
//!          broadcast sync_packet / sync_group_packet
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C      (publisher gets its echo)
//! ```
//!
//! Each connection owns one writer task fed by an mpsc queue. Replies and
//! topic broadcasts share that queue; every joined topic gets a forwarder
//! task that copies the topic's broadcast receiver into it.
//!
//! The backend does not keep entity state. It orders operations per entity,
//! hands out versions and relays accepted operations to every member.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use entsync_core::protocol::{
    from_wire, to_wire, Ack, EntityPush, Envelope, GroupPush, GroupSyncPacket, SyncPacket,
    SYNC_GROUP_PACKET_EVENT, SYNC_PACKET_EVENT,
};

use crate::broadcast::TopicRegistry;
use crate::frame::{Frame, Reply, HEARTBEAT_EVENT, HEARTBEAT_TOPIC, JOIN_EVENT, LEAVE_EVENT};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Expected client heartbeat interval in seconds. A session that sends
    /// nothing for twice this long is dropped; 0 disables the check.
    pub heartbeat_interval_secs: u64,
    /// Topics clients may join (None = any)
    pub allowed_topics: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            allowed_topics: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by `ENTSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    ///
    /// Keys: `ENTSYNC_BIND_ADDR`, `ENTSYNC_BROADCAST_CAPACITY`,
    /// `ENTSYNC_HEARTBEAT_SECS`, `ENTSYNC_TOPICS` (comma separated).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("ENTSYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("ENTSYNC_BROADCAST_CAPACITY") {
            config.broadcast_capacity = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ENTSYNC_BROADCAST_CAPACITY",
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = lookup("ENTSYNC_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "ENTSYNC_HEARTBEAT_SECS",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup("ENTSYNC_TOPICS") {
            let topics: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            config.allowed_topics = (!topics.is_empty()).then_some(topics);
        }

        Ok(config)
    }

    /// How long a session may stay silent before it is dropped.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(2)))
    }

    fn allows(&self, topic: &str) -> bool {
        self.allowed_topics
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|t| t == topic))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
    pub accepted_operations: u64,
    pub rejected_frames: u64,
    pub timed_out_sessions: u64,
}

/// The sync backend.
pub struct SyncServer {
    config: ServerConfig,
    topics: Arc<TopicRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection state.
struct Session {
    id: Uuid,
    addr: SocketAddr,
    outgoing: mpsc::Sender<Message>,
    /// topic → forwarder task
    joined: HashMap<String, JoinHandle<()>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let topics = Arc::new(TopicRegistry::new(config.broadcast_capacity));
        Self {
            config,
            topics,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, topics, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        topics: Arc<TopicRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(config.broadcast_capacity.max(16));
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut session = Session {
            id: Uuid::new_v4(),
            addr,
            outgoing: out_tx,
            joined: HashMap::new(),
        };

        let idle_timeout = config.idle_timeout();
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::warn!("No frames from {addr} for {limit:?}, dropping session");
                        stats.write().await.timed_out_sessions += 1;
                        break;
                    }
                },
                None => ws_receiver.next().await,
            };
            let Some(msg) = next else {
                break;
            };
            match msg {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            Self::handle_frame(&mut session, frame, &topics, &stats, &config).await
                        }
                        Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = session.outgoing.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
                _ => {}
            }
        }

        // Cleanup: leave every joined topic
        for (topic, forwarder) in session.joined.drain() {
            forwarder.abort();
            if let Some(group) = topics.get(&topic).await {
                group.remove_member(&session.id).await;
            }
            if topics.remove_if_empty(&topic).await {
                log::info!("Topic '{topic}' removed (empty)");
            }
        }
        drop(session);
        let _ = writer.await;

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_topics = topics.topic_count().await;
        Ok(())
    }

    async fn handle_frame(
        session: &mut Session,
        frame: Frame,
        topics: &Arc<TopicRegistry>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) {
        let reply = match (frame.topic.as_str(), frame.event.as_str()) {
            (HEARTBEAT_TOPIC, HEARTBEAT_EVENT) => Reply::ok(json!({})),
            (_, JOIN_EVENT) => Self::handle_join(session, &frame, topics, config).await,
            (_, LEAVE_EVENT) => Self::handle_leave(session, &frame, topics).await,
            (_, SYNC_PACKET_EVENT) | (_, SYNC_GROUP_PACKET_EVENT)
                if !session.joined.contains_key(&frame.topic) =>
            {
                Reply::error("not joined")
            }
            (_, SYNC_PACKET_EVENT) => Self::handle_entity_push(&frame, topics).await,
            (_, SYNC_GROUP_PACKET_EVENT) => Self::handle_group_push(&frame, topics).await,
            (_, event) => {
                log::debug!("Unhandled event '{event}' on '{}'", frame.topic);
                Reply::error("unknown event")
            }
        };

        {
            let mut s = stats.write().await;
            match reply.status {
                crate::frame::ReplyStatus::Ok => {
                    if frame.event == SYNC_PACKET_EVENT || frame.event == SYNC_GROUP_PACKET_EVENT {
                        s.accepted_operations += 1;
                    }
                }
                crate::frame::ReplyStatus::Error => s.rejected_frames += 1,
            }
            s.active_topics = topics.topic_count().await;
        }

        if frame.reference.is_some() {
            match Frame::reply_to(&frame, &reply).encode() {
                Ok(text) => {
                    let _ = session.outgoing.send(Message::Text(text.into())).await;
                }
                Err(e) => log::error!("Failed to encode reply for {}: {e}", session.addr),
            }
        }
    }

    async fn handle_join(
        session: &mut Session,
        frame: &Frame,
        topics: &Arc<TopicRegistry>,
        config: &ServerConfig,
    ) -> Reply {
        if !config.allows(&frame.topic) {
            log::warn!("{} tried to join unknown topic '{}'", session.addr, frame.topic);
            return Reply::error("unmatched topic");
        }
        if session.joined.contains_key(&frame.topic) {
            return Reply::ok(json!({}));
        }

        let group = topics.get_or_create(&frame.topic).await;
        let mut rx = group.add_member(session.id).await;
        let outgoing = session.outgoing.clone();
        let topic = frame.topic.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(text) => {
                        if outgoing
                            .send(Message::Text(text.as_str().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Member of '{topic}' lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        session.joined.insert(frame.topic.clone(), forwarder);

        log::info!("{} joined '{}'", session.addr, frame.topic);
        Reply::ok(json!({}))
    }

    async fn handle_leave(session: &mut Session, frame: &Frame, topics: &Arc<TopicRegistry>) -> Reply {
        if let Some(forwarder) = session.joined.remove(&frame.topic) {
            forwarder.abort();
            if let Some(group) = topics.get(&frame.topic).await {
                group.remove_member(&session.id).await;
            }
            topics.remove_if_empty(&frame.topic).await;
            log::info!("{} left '{}'", session.addr, frame.topic);
        }
        Reply::ok(json!({}))
    }

    async fn handle_entity_push(frame: &Frame, topics: &Arc<TopicRegistry>) -> Reply {
        let push: Envelope<EntityPush> = match from_wire(frame.payload.clone()) {
            Ok(push) => push,
            Err(e) => return Reply::error(e.to_string()),
        };
        let Some(group) = topics.get(&frame.topic).await else {
            return Reply::error("not joined");
        };

        let EntityPush { entity_id, operation } = push.payload;
        let version = group.next_entity_version(&entity_id, operation.id).await;
        let packet = SyncPacket {
            version,
            entity_id,
            operation,
        };
        log::debug!(
            "Accepted operation for '{}' on '{}' as version {version}",
            packet.entity_id,
            frame.topic
        );

        Self::fan_out(&group, &frame.topic, SYNC_PACKET_EVENT, to_wire(&packet));
        ack(version)
    }

    async fn handle_group_push(frame: &Frame, topics: &Arc<TopicRegistry>) -> Reply {
        let push: Envelope<GroupPush> = match from_wire(frame.payload.clone()) {
            Ok(push) => push,
            Err(e) => return Reply::error(e.to_string()),
        };
        let Some(group) = topics.get(&frame.topic).await else {
            return Reply::error("not joined");
        };

        let operation = push.payload.operation;
        let version = group.next_group_version(operation.id).await;
        log::debug!(
            "Accepted {:?} of {} ids on '{}' as version {version}",
            operation.action,
            operation.ids.len(),
            frame.topic
        );

        let packet = GroupSyncPacket { version, operation };
        Self::fan_out(&group, &frame.topic, SYNC_GROUP_PACKET_EVENT, to_wire(&packet));
        ack(version)
    }

    fn fan_out(
        group: &crate::broadcast::TopicGroup,
        topic: &str,
        event: &str,
        payload: Result<Value, entsync_core::ProtocolError>,
    ) {
        let result = payload.and_then(|payload| group.broadcast(&Frame::broadcast(topic, event, payload)));
        if let Err(e) = result {
            log::error!("Failed to broadcast '{event}' on '{topic}': {e}");
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }
}

fn ack(version: u64) -> Reply {
    match to_wire(&Ack { version }) {
        Ok(response) => Reply::ok(response),
        Err(e) => Reply::error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.allowed_topics.is_none());
        assert!(config.allows("anything"));
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: Map<&str, &str> = [
            ("ENTSYNC_BIND_ADDR", "0.0.0.0:4000"),
            ("ENTSYNC_BROADCAST_CAPACITY", "512"),
            ("ENTSYNC_HEARTBEAT_SECS", "15"),
            ("ENTSYNC_TOPICS", "Organizations, Tags,,Contacts"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.broadcast_capacity, 512);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(
            config.allowed_topics,
            Some(vec!["Organizations".to_string(), "Tags".to_string(), "Contacts".to_string()])
        );
        assert!(config.allows("Tags"));
        assert!(!config.allows("Reminder"));
    }

    #[test]
    fn test_config_from_empty_lookup_is_default() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
    }

    #[test]
    fn test_config_invalid_capacity() {
        let err = ServerConfig::from_lookup(|k| {
            (k == "ENTSYNC_BROADCAST_CAPACITY").then(|| "0".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "ENTSYNC_BROADCAST_CAPACITY",
                value: "0".to_string()
            }
        );
    }

    #[test]
    fn test_config_invalid_heartbeat() {
        let result = ServerConfig::from_lookup(|k| (k == "ENTSYNC_HEARTBEAT_SECS").then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_idle_timeout_is_twice_heartbeat() {
        let config = ServerConfig {
            heartbeat_interval_secs: 15,
            ..ServerConfig::default()
        };
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));

        let disabled = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(disabled.idle_timeout(), None);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.accepted_operations, 0);
        assert_eq!(server.topics().topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_entity_push_assigns_version_and_broadcasts() {
        let topics = Arc::new(TopicRegistry::new(16));
        let group = topics.get_or_create("Organizations").await;
        let mut rx = group.add_member(Uuid::new_v4()).await;

        let payload = json!({"payload": {"entity_id": "org-1", "operation": {"id": 3, "diff": []}}});
        let frame = Frame::push("Organizations", SYNC_PACKET_EVENT, payload, "5", Some("1".into()));
        let reply = SyncServer::handle_entity_push(&frame, &topics).await;
        assert_eq!(reply.status, crate::frame::ReplyStatus::Ok);
        assert_eq!(reply.response["version"], 4);

        let broadcast = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        let packet: SyncPacket = from_wire(broadcast.payload).unwrap();
        assert_eq!(packet.version, 4);
        assert_eq!(packet.entity_id, "org-1");
    }

    #[tokio::test]
    async fn test_malformed_push_rejected() {
        let topics = Arc::new(TopicRegistry::new(16));
        topics.get_or_create("Tags").await;
        let frame = Frame::push("Tags", SYNC_PACKET_EVENT, json!({"nope": true}), "1", None);
        let reply = SyncServer::handle_entity_push(&frame, &topics).await;
        assert_eq!(reply.status, crate::frame::ReplyStatus::Error);
    }

    #[tokio::test]
    async fn test_group_push_assigns_group_version() {
        let topics = Arc::new(TopicRegistry::new(16));
        topics.get_or_create("Tags").await;
        let payload = json!({"payload": {"operation": {"id": 0, "action": "APPEND", "ids": ["t1"]}}});
        let frame = Frame::push("Tags", SYNC_GROUP_PACKET_EVENT, payload, "1", None);

        let first = SyncServer::handle_group_push(&frame, &topics).await;
        let second = SyncServer::handle_group_push(&frame, &topics).await;
        assert_eq!(first.response["version"], 1);
        assert_eq!(second.response["version"], 2);
    }
}
