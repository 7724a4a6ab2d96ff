//! # entsync-store — optimistic entity and collection stores
//!
//! Every domain object lives in an [`EntityStore`]: local mutations apply
//! at once, are diffed into an [`Operation`](entsync_core::Operation) and
//! persisted in the background, and roll back on rejection. Accepted
//! operations from other clients arrive over the topic and are patched in.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   update/load    ┌──────────────┐   Remote::persist   ┌──────────┐
//! │  caller / UI │ ───────────────► │ EntityStore  │ ──────────────────► │  Remote  │
//! └──────┬───────┘                  └──────▲───────┘                     └──────────┘
//!        │ create/remove/bootstrap         │ sync_packet (by entity_id)
//!        ▼                                 │
//! ┌──────────────┐  sync_group_packet ┌────┴─────────┐
//! │  GroupStore  │ ◄────────────────► │ChannelHandle │
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — single-entity store, ledger, rollback, conflict policy
//! - [`group`] — identity map, pagination, temporary ids, group sync
//! - [`remote`] — `Entity` and `Remote` collaborator traits
//! - [`event`] — change notifications for binding layers

pub mod entity;
pub mod event;
pub mod group;
mod ledger;
pub mod remote;

// Re-exports for convenience
pub use entity::{
    ApplyOutcome, ConflictPolicy, EntityStore, Pending, PendingMutation, StoreConfig,
    StoreContext, StoreError, SyncState, UpdateOptions,
};
pub use event::{Change, GroupEvent, StoreEvent};
pub use group::{is_temporary_id, CreateOptions, GroupConfig, GroupStore, TEMP_ID_PREFIX};
pub use remote::{Entity, Page, Remote, RemoteError};
