//! Sync wire contract shared by stores, transport and backend.
//!
//! ```text
//! outbound push  "sync_packet"        {"payload": {"entity_id", "operation"}}   → ok {"version"}
//! inbound bcast  "sync_packet"        SyncPacket {version, entity_id, operation}
//! outbound push  "sync_group_packet"  {"payload": {"operation": GroupOperation}} → ok {"version"}
//! inbound bcast  "sync_group_packet"  GroupSyncPacket {version, operation}
//! ```
//!
//! `Operation::id` is the version the diff was computed against (causal
//! position), while `SyncPacket::version` is the server-assigned version
//! after the operation was accepted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::patch::{self, PatchError, PatchOp, PathSegment};

/// Broadcast/push event carrying entity-level operations.
pub const SYNC_PACKET_EVENT: &str = "sync_packet";
/// Broadcast/push event carrying collection-level operations.
pub const SYNC_GROUP_PACKET_EVENT: &str = "sync_group_packet";

/// Monotonic per-entity (or per-group) sequence number.
pub type Version = u64;

/// A versioned diff produced by one local mutation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Version,
    pub diff: Vec<PatchOp>,
}

impl Operation {
    pub fn new(id: Version, diff: Vec<PatchOp>) -> Self {
        Self { id, diff }
    }

    /// Diff two snapshots into an operation generated against `id`.
    pub fn between(id: Version, before: &Value, after: &Value) -> Self {
        Self::new(id, patch::diff(before, after))
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Apply this operation's diff to a copy of `base`.
    pub fn apply_to(&self, base: &Value) -> Result<Value, PatchError> {
        patch::apply(base, &self.diff)
    }
}

/// An accepted operation as broadcast to every member of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub version: Version,
    pub entity_id: String,
    pub operation: Operation,
}

/// Collection-level structural action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupAction {
    Append,
    #[serde(alias = "DELETE")]
    Remove,
    Invalidate,
}

/// A collection-level operation recorded in a group's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOperation {
    pub id: Version,
    pub action: GroupAction,
    pub ids: Vec<String>,
}

/// An accepted group operation as broadcast to the topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSyncPacket {
    pub version: Version,
    pub operation: GroupOperation,
}

/// Acknowledge payload for a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub version: Version,
}

/// Outbound push wrapper: `{"payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub payload: P,
}

/// Body of an outbound `sync_packet` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPush {
    pub entity_id: String,
    pub operation: Operation,
}

/// Body of an outbound `sync_group_packet` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPush {
    pub operation: GroupOperation,
}

/// Wire encode/decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Encode any wire type into a JSON value.
pub fn to_wire<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode any wire type from a JSON value.
pub fn from_wire<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

impl Envelope<EntityPush> {
    pub fn entity(entity_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            payload: EntityPush {
                entity_id: entity_id.into(),
                operation,
            },
        }
    }
}

impl Envelope<GroupPush> {
    pub fn group(operation: GroupOperation) -> Self {
        Self {
            payload: GroupPush { operation },
        }
    }
}

/// Flatten an operation into a partial update keyed by top-level field.
///
/// Every top-level key touched by the diff is copied from `value` (the
/// post-mutation state); keys that no longer exist map to `null`. A diff
/// that replaces the root copies every field of `value`.
pub fn make_payload(operation: &Operation, value: &Value) -> Map<String, Value> {
    let mut payload = Map::new();
    for op in &operation.diff {
        match op.path().first() {
            None => {
                if let Value::Object(fields) = value {
                    payload.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            Some(segment) => {
                let key = match segment {
                    PathSegment::Key(key) => key.clone(),
                    PathSegment::Index(i) => i.to_string(),
                };
                let field = value.get(&key).cloned().unwrap_or(Value::Null);
                payload.insert(key, field);
            }
        }
    }
    payload
}
