//! # entsync-channel — persistent channel transport for entity sync
//!
//! One WebSocket per session carries many topics. Stores push operations
//! on their topic and receive every accepted operation back as a broadcast.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Connection  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (backend)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ChannelHandle│                     │ TopicGroup  │
//! │ (per topic) │                     │ (fan-out)   │
//! └─────────────┘                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`frame`] — JSON frame codec (join/leave/reply/heartbeat)
//! - [`connection`] — client socket, topic join, push/ack, subscriptions
//! - [`broadcast`] — per-topic fan-out and version counters
//! - [`server`] — reference backend used by the binary and by tests

pub mod broadcast;
pub mod connection;
pub mod frame;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, TopicGroup, TopicRegistry};
pub use connection::{ChannelError, ChannelHandle, Connection, ConnectionConfig, ConnectionState};
pub use frame::{Frame, Reply, ReplyStatus};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
