//! JSON frame codec for the channel socket.
//!
//! Wire format (one JSON object per WebSocket text message):
//! ```text
//! {"join_ref": "1", "ref": "7", "topic": "Organizations", "event": "sync_packet", "payload": {...}}
//! ```
//!
//! `ref` correlates a push with its `phx_reply`; `join_ref` ties a frame to
//! the join that opened the topic. Broadcasts carry neither.

use entsync_core::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Join a topic.
pub const JOIN_EVENT: &str = "phx_join";
/// Leave a topic.
pub const LEAVE_EVENT: &str = "phx_leave";
/// Server reply to any push carrying a `ref`.
pub const REPLY_EVENT: &str = "phx_reply";
/// Keep-alive push.
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Topic that heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// One message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub join_ref: Option<String>,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn ok(response: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    /// Error reply with a `{"reason": ...}` response.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            response: json!({ "reason": reason.into() }),
        }
    }
}

impl Frame {
    /// Create a client push that expects a reply.
    pub fn push(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: impl Into<String>,
        join_ref: Option<String>,
    ) -> Self {
        Self {
            join_ref,
            reference: Some(reference.into()),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a server broadcast (no ref).
    pub fn broadcast(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            reference: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create the reply to `request`.
    pub fn reply_to(request: &Frame, reply: &Reply) -> Self {
        Self {
            join_ref: request.join_ref.clone(),
            reference: request.reference.clone(),
            topic: request.topic.clone(),
            event: REPLY_EVENT.to_string(),
            payload: serde_json::to_value(reply).unwrap_or(Value::Null),
        }
    }

    /// Create a heartbeat push.
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::push(HEARTBEAT_TOPIC, HEARTBEAT_EVENT, json!({}), reference, None)
    }

    /// Parse the reply carried by a `phx_reply` frame.
    pub fn as_reply(&self) -> Option<Reply> {
        if self.event != REPLY_EVENT {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Serialize to a text message.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a text message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
