//! Change notifications emitted after every store mutation.
//!
//! Stores publish on a tokio broadcast channel; any binding layer can
//! subscribe through `changes()` without the store knowing about it.
//! A receiver that falls behind gets `RecvError::Lagged` and should re-read
//! the store.

use entsync_core::protocol::{GroupAction, Version};

/// What happened to a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Snapshot loaded or refetched.
    Loaded,
    /// Local mutation applied ahead of confirmation.
    Optimistic,
    /// Local mutation confirmed.
    Acknowledged,
    /// Local mutation rejected and reverted.
    RolledBack { error: String },
    /// Another client's accepted operation was applied.
    Remote,
    /// Id replaced (temporary id promotion).
    Rekeyed { previous: String },
    /// Refetch failed or an error was set by hand.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub entity_id: String,
    pub version: Version,
    pub change: Change,
}

/// What happened to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// Items registered by `load` or a page fetch. Only new ids are listed.
    Loaded { ids: Vec<String> },
    /// A structural action was applied locally or from a broadcast.
    Synced {
        action: GroupAction,
        ids: Vec<String>,
        version: Version,
    },
    /// A temporary id was promoted to its server id.
    Created { temp_id: String, id: String },
    /// A collection-level call failed.
    Failed { error: String },
}
