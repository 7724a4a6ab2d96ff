//! # entsync-core — Diff/patch engine and sync wire types
//!
//! Pure, synchronous building blocks shared by the channel transport and
//! the entity stores. No I/O happens in this crate.
//!
//! ## Architecture
//!
//! ```text
//!   before ──┐                      ┌── Operation { id, diff }
//!            ├── patch::diff ──────►│
//!   after  ──┘                      └── SyncPacket { version, entity_id, operation }
//!
//!   base ──── patch::apply(diff) ──► next   (all-or-nothing, base untouched)
//! ```
//!
//! ## Modules
//!
//! - [`patch`] — Structural diff and path-addressed patch application
//! - [`protocol`] — Operation, SyncPacket, group operations and push envelopes

pub mod patch;
pub mod protocol;

// Re-exports for convenience
pub use patch::{
    apply, apply_op, diff, format_path, get, revert, PatchError, PatchOp, Path, PathSegment,
};
pub use protocol::{
    from_wire, make_payload, to_wire, Ack, EntityPush, Envelope, GroupAction, GroupOperation,
    GroupPush, GroupSyncPacket, Operation, ProtocolError, SyncPacket, Version,
    SYNC_GROUP_PACKET_EVENT, SYNC_PACKET_EVENT,
};
