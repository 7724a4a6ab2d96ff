//! Collaborator traits: what a store needs from the entity shape and from
//! the request/response API that persists it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use entsync_core::protocol::{Ack, Operation};

/// A domain object a store can hold.
///
/// The store only needs to read and rewrite the id; everything else is
/// diffed through the JSON projection.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> String;
    fn set_id(&mut self, id: &str);
}

/// Errors reported by a [`Remote`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{0}")]
    Failed(String),
    #[error("Remote does not support {0}")]
    Unsupported(&'static str),
}

impl RemoteError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_elements: usize,
}

/// The request/response API behind a store.
///
/// Only `persist` is required; stores that never refetch, create, remove
/// or paginate can leave the other methods at their defaults.
#[async_trait]
pub trait Remote<T: Entity>: Send + Sync {
    /// Persist one local operation. `value` is the post-mutation state.
    ///
    /// Returning an [`Ack`] advances the store's version; `Ok(None)` accepts
    /// the change without a version.
    async fn persist(
        &self,
        entity_id: &str,
        operation: &Operation,
        value: &T,
    ) -> Result<Option<Ack>, RemoteError>;

    /// Fetch the authoritative state of one entity.
    async fn fetch(&self, _id: &str) -> Result<T, RemoteError> {
        Err(RemoteError::Unsupported("fetch"))
    }

    /// Create an entity and return its server-assigned id.
    async fn create(&self, _value: &T) -> Result<String, RemoteError> {
        Err(RemoteError::Unsupported("create"))
    }

    async fn remove(&self, _ids: &[String]) -> Result<(), RemoteError> {
        Err(RemoteError::Unsupported("remove"))
    }

    /// List entities, `page` starting at 0.
    async fn list(&self, _page: usize, _limit: usize) -> Result<Page<T>, RemoteError> {
        Err(RemoteError::Unsupported("list"))
    }
}
