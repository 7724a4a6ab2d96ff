//! Entity store: one domain object with optimistic mutation, a version
//! ledger, rollback and broadcast reconciliation.
//!
//! ```text
//!  update(f) ──► draft = f(value.clone()) ──► diff ──► history.push(op), value = draft
//!                                               │
//!                                               ▼
//!                           spawn: Remote::persist ──► channel push
//!                                   │ ok                    │ error
//!                                   ▼                       ▼
//!                 version = max(version, ack)      revert diff, drop op, set error
//!
//!  sync_packet ──► apply_packet ──► version unseen, not our echo? ──► apply diff
//! ```
//!
//! The local mutation track and the broadcast track are independent until
//! an ack resolves; [`ConflictPolicy`] decides what a broadcast does while a
//! mutation is still pending.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use entsync_channel::connection::{ChannelError, ChannelHandle};
use entsync_core::patch::{self, PatchError};
use entsync_core::protocol::{
    from_wire, to_wire, Ack, Envelope, Operation, ProtocolError, SyncPacket, Version,
    SYNC_PACKET_EVENT,
};

use crate::event::{Change, StoreEvent};
use crate::ledger::SeenVersions;
use crate::remote::{Entity, Remote, RemoteError};

/// What a broadcast does while a local mutation awaits its ack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Apply at once; the last applied change wins.
    #[default]
    BroadcastWins,
    /// Queue until no mutation is pending, then apply in version order.
    DeferWhilePending,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub conflict_policy: ConflictPolicy,
    /// Buffered change events per `changes()` receiver
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::BroadcastWins,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unbootstrapped,
    Stable,
    PendingAck,
}

/// Result of offering a broadcast to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Version already reflected, or the echo of our own operation.
    Stale,
    /// Queued behind a pending local mutation.
    Deferred,
    /// The diff did not fit the current value; packet dropped.
    Conflict,
    /// Other entity, or nothing loaded yet.
    Ignored,
}

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store '{0}' has no value yet")]
    NotBootstrapped(String),
    #[error("Store '{0}' has no remote")]
    NoRemote(String),
    #[error("Store '{0}' has no channel")]
    NoChannel(String),
    #[error("Entity '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Background task aborted")]
    Aborted,
}

/// Collaborators handed to a store at construction.
#[derive(Clone)]
pub struct StoreContext<T: Entity> {
    pub remote: Option<Arc<dyn Remote<T>>>,
    pub channel: Option<ChannelHandle>,
    pub config: StoreConfig,
}

impl<T: Entity> Default for StoreContext<T> {
    fn default() -> Self {
        Self {
            remote: None,
            channel: None,
            config: StoreConfig::default(),
        }
    }
}

impl<T: Entity> StoreContext<T> {
    pub fn with_remote(mut self, remote: Arc<dyn Remote<T>>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_channel(mut self, channel: ChannelHandle) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// Send the change to the remote and channel. `false` keeps it local.
    pub mutate: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { mutate: true }
    }
}

/// Completion handle for work a store finishes in the background.
///
/// The optimistic effect is already visible when this is returned; awaiting
/// `wait()` yields the confirmed result. Failures are also recorded in the
/// store's `error`, so dropping the handle loses nothing.
#[derive(Debug)]
pub struct Pending<R> {
    inner: PendingInner<R>,
}

#[derive(Debug)]
enum PendingInner<R> {
    Ready(Result<R, StoreError>),
    InFlight(JoinHandle<Result<R, StoreError>>),
}

/// Completion of an `update`, yielding the store version after the ack.
pub type PendingMutation = Pending<Version>;

impl<R> Pending<R> {
    pub(crate) fn ready(result: Result<R, StoreError>) -> Self {
        Self {
            inner: PendingInner::Ready(result),
        }
    }

    pub(crate) fn in_flight(handle: JoinHandle<Result<R, StoreError>>) -> Self {
        Self {
            inner: PendingInner::InFlight(handle),
        }
    }

    /// Whether a round-trip is still outstanding.
    pub fn is_in_flight(&self) -> bool {
        match &self.inner {
            PendingInner::Ready(_) => false,
            PendingInner::InFlight(handle) => !handle.is_finished(),
        }
    }

    pub async fn wait(self) -> Result<R, StoreError> {
        match self.inner {
            PendingInner::Ready(result) => result,
            PendingInner::InFlight(handle) => handle.await.unwrap_or_else(|e| {
                log::error!("Store task failed: {e}");
                Err(StoreError::Aborted)
            }),
        }
    }
}

struct Entry {
    seq: u64,
    operation: Operation,
    in_flight: bool,
}

struct State<T> {
    id: String,
    value: Option<T>,
    version: Version,
    seen: SeenVersions,
    history: Vec<Entry>,
    next_seq: u64,
    is_loading: bool,
    error: Option<String>,
    pending: usize,
    deferred: Vec<SyncPacket>,
}

/// One local mutation on its way to the server.
struct InFlight<T> {
    seq: u64,
    entity_id: String,
    operation: Operation,
    before: T,
    before_json: Value,
    after: T,
    after_json: Value,
}

struct Inner<T: Entity> {
    state: RwLock<State<T>>,
    remote: Option<Arc<dyn Remote<T>>>,
    channel: RwLock<Option<ChannelHandle>>,
    config: StoreConfig,
    events: broadcast::Sender<StoreEvent>,
}

/// Shared handle to one entity's synchronized state.
pub struct EntityStore<T: Entity> {
    inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> std::fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: Entity> EntityStore<T> {
    /// Create an empty store for `id`; it stays unbootstrapped until `load`.
    pub fn new(id: impl Into<String>, context: StoreContext<T>) -> Self {
        Self::build(id.into(), None, 0, context)
    }

    /// Create a store already holding `value` at `version`.
    pub fn with_value(value: T, version: Version, context: StoreContext<T>) -> Self {
        Self::build(value.id(), Some(value), version, context)
    }

    fn build(id: String, value: Option<T>, version: Version, context: StoreContext<T>) -> Self {
        let (events, _) = broadcast::channel(context.config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    id,
                    value,
                    version,
                    seen: SeenVersions::new(version),
                    history: Vec::new(),
                    next_seq: 0,
                    is_loading: false,
                    error: None,
                    pending: 0,
                    deferred: Vec::new(),
                }),
                remote: context.remote,
                channel: RwLock::new(context.channel),
                config: context.config,
                events,
            }),
        }
    }

    pub async fn id(&self) -> String {
        self.inner.state.read().await.id.clone()
    }

    pub async fn value(&self) -> Option<T> {
        self.inner.state.read().await.value.clone()
    }

    pub async fn version(&self) -> Version {
        self.inner.state.read().await.version
    }

    /// Locally originated operations still on the ledger, oldest first.
    pub async fn history(&self) -> Vec<Operation> {
        self.inner
            .state
            .read()
            .await
            .history
            .iter()
            .map(|entry| entry.operation.clone())
            .collect()
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.state.read().await.error.clone()
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.inner.state.read().await.value.is_some()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.state.read().await.is_loading
    }

    pub async fn sync_state(&self) -> SyncState {
        let state = self.inner.state.read().await;
        match (&state.value, state.pending) {
            (None, _) => SyncState::Unbootstrapped,
            (Some(_), 0) => SyncState::Stable,
            (Some(_), _) => SyncState::PendingAck,
        }
    }

    /// Subscribe to change notifications.
    pub fn changes(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn remote(&self) -> Option<&Arc<dyn Remote<T>>> {
        self.inner.remote.as_ref()
    }

    pub async fn channel(&self) -> Option<ChannelHandle> {
        self.inner.channel.read().await.clone()
    }

    /// Attach (or replace) the topic this store publishes on.
    pub async fn attach_channel(&self, channel: ChannelHandle) {
        *self.inner.channel.write().await = Some(channel);
    }

    /// Bootstrap from an authoritative snapshot. History is left alone.
    pub async fn load(&self, value: T) {
        let mut state = self.inner.state.write().await;
        state.value = Some(value);
        state.is_loading = false;
        self.emit(&state, Change::Loaded);
    }

    /// Bootstrap from a snapshot taken at `version`. The version never moves back.
    pub async fn load_versioned(&self, value: T, version: Version) {
        let mut state = self.inner.state.write().await;
        state.value = Some(value);
        state.version = state.version.max(version);
        state.seen.raise_floor(version);
        state.is_loading = false;
        self.emit(&state, Change::Loaded);
    }

    /// Apply `mutator` optimistically and persist it in the background.
    pub async fn update<F>(&self, mutator: F) -> Result<PendingMutation, StoreError>
    where
        F: FnOnce(&mut T),
    {
        self.update_with(mutator, UpdateOptions::default()).await
    }

    pub async fn update_with<F>(
        &self,
        mutator: F,
        options: UpdateOptions,
    ) -> Result<PendingMutation, StoreError>
    where
        F: FnOnce(&mut T),
    {
        let has_channel = self.inner.channel.read().await.is_some();
        let mut state = self.inner.state.write().await;

        let Some(before) = state.value.clone() else {
            return Err(StoreError::NotBootstrapped(state.id.clone()));
        };
        let mut after = before.clone();
        mutator(&mut after);

        let before_json = to_wire(&before)?;
        let after_json = to_wire(&after)?;
        let operation = Operation::between(state.version, &before_json, &after_json);
        if operation.is_empty() {
            log::trace!("Update of '{}' changed nothing", state.id);
            return Ok(Pending::ready(Ok(state.version)));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let in_flight = options.mutate && (self.inner.remote.is_some() || has_channel);
        state.history.push(Entry {
            seq,
            operation: operation.clone(),
            in_flight,
        });
        state.value = Some(after.clone());
        state.error = None;
        self.emit(&state, Change::Optimistic);

        if !in_flight {
            return Ok(Pending::ready(Ok(state.version)));
        }

        state.pending += 1;
        let flight = InFlight {
            seq,
            entity_id: state.id.clone(),
            operation,
            before,
            before_json,
            after,
            after_json,
        };
        drop(state);

        let store = self.clone();
        Ok(Pending::in_flight(tokio::spawn(async move {
            store.settle(flight).await
        })))
    }

    /// Wait for the remote side of one mutation and ack or roll back.
    async fn settle(&self, flight: InFlight<T>) -> Result<Version, StoreError> {
        let outcome = self
            .persist(&flight.entity_id, &flight.operation, &flight.after)
            .await;

        let mut state = self.inner.state.write().await;
        state.pending = state.pending.saturating_sub(1);

        let result = match outcome {
            Ok(acked) => {
                for version in acked {
                    state.seen.insert(version);
                    state.version = state.version.max(version);
                }
                if let Some(entry) = state.history.iter_mut().find(|e| e.seq == flight.seq) {
                    entry.in_flight = false;
                }
                state.error = None;
                log::debug!("'{}' acknowledged at version {}", state.id, state.version);
                self.emit(&state, Change::Acknowledged);
                Ok(state.version)
            }
            Err(e) => {
                let message = e.to_string();
                log::warn!("Rolling back update of '{}': {message}", state.id);
                Self::revert(&mut state, flight);
                state.error = Some(message.clone());
                self.emit(&state, Change::RolledBack { error: message });
                Err(e)
            }
        };

        if state.pending == 0 {
            self.drain_deferred(&mut state);
        }
        result
    }

    /// Persist through the remote (if any), then publish on the channel.
    /// Returns every version the server assigned to the operation.
    ///
    /// Without a remote the channel push is the persist call and its
    /// rejection rolls back. With a remote, a failed publish is only logged.
    async fn persist(
        &self,
        entity_id: &str,
        operation: &Operation,
        value: &T,
    ) -> Result<Vec<Version>, StoreError> {
        let channel = self.channel().await;

        let Some(remote) = self.inner.remote.as_ref() else {
            return match channel {
                Some(channel) => publish(&channel, entity_id, operation).await.map(|v| vec![v]),
                None => Ok(Vec::new()),
            };
        };

        let mut versions: Vec<Version> = remote
            .persist(entity_id, operation, value)
            .await?
            .map(|ack| ack.version)
            .into_iter()
            .collect();

        if let Some(channel) = channel {
            match publish(&channel, entity_id, operation).await {
                Ok(published) => versions.push(published),
                Err(e) => log::warn!(
                    "Persisted '{entity_id}' but publishing on '{}' failed: {e}",
                    channel.topic()
                ),
            }
        }
        Ok(versions)
    }

    /// Undo one mutation and drop it from the ledger.
    ///
    /// Only paths that still hold this mutation's value are reverted. When
    /// nothing else touched the value this lands exactly on the pre-mutation
    /// snapshot; fields changed meanwhile by broadcasts or later mutations
    /// keep their newer value.
    fn revert(state: &mut State<T>, flight: InFlight<T>) {
        state.history.retain(|entry| entry.seq != flight.seq);

        let reverted = match state.value.as_ref() {
            Some(current) => to_wire(current)
                .map(|json| patch::revert(&json, &flight.before_json, &flight.after_json))
                .and_then(from_wire::<T>)
                .map_err(StoreError::from),
            None => Err(StoreError::NotBootstrapped(state.id.clone())),
        };

        state.value = Some(match reverted {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Restoring snapshot of '{}' after failed revert: {e}", state.id);
                flight.before
            }
        });
    }

    /// Offer an inbound broadcast to this store.
    pub async fn apply_packet(&self, packet: SyncPacket) -> ApplyOutcome {
        let mut state = self.inner.state.write().await;

        if packet.entity_id != state.id || state.value.is_none() {
            return ApplyOutcome::Ignored;
        }
        if state.seen.contains(packet.version) {
            log::trace!("Skipping seen sync packet v{} for '{}'", packet.version, state.id);
            return ApplyOutcome::Stale;
        }
        // Our own echo can overtake the ack.
        if state
            .history
            .iter()
            .any(|entry| entry.in_flight && entry.operation == packet.operation)
        {
            log::trace!("Echo v{} of a pending update to '{}'", packet.version, state.id);
            state.seen.insert(packet.version);
            state.version = state.version.max(packet.version);
            return ApplyOutcome::Stale;
        }
        if self.inner.config.conflict_policy == ConflictPolicy::DeferWhilePending
            && state.pending > 0
        {
            log::debug!("Deferring sync packet v{} for '{}'", packet.version, state.id);
            state.deferred.push(packet);
            return ApplyOutcome::Deferred;
        }

        self.apply_remote(&mut state, &packet)
    }

    fn apply_remote(&self, state: &mut State<T>, packet: &SyncPacket) -> ApplyOutcome {
        let Some(current) = state.value.as_ref() else {
            return ApplyOutcome::Ignored;
        };

        match patched(current, &packet.operation) {
            Ok(next) => {
                state.value = Some(next);
                state.seen.insert(packet.version);
                state.version = state.version.max(packet.version);
                self.emit(state, Change::Remote);
                ApplyOutcome::Applied
            }
            Err(e) => {
                log::warn!(
                    "Dropping sync packet v{} for '{}': {e}",
                    packet.version,
                    state.id
                );
                ApplyOutcome::Conflict
            }
        }
    }

    fn drain_deferred(&self, state: &mut State<T>) {
        let mut deferred = std::mem::take(&mut state.deferred);
        deferred.sort_by_key(|packet| packet.version);
        for packet in deferred {
            if !state.seen.contains(packet.version) {
                self.apply_remote(state, &packet);
            }
        }
    }

    /// Route this store's `sync_packet` broadcasts into `apply_packet`.
    ///
    /// The task holds only a weak reference and ends once the store is
    /// dropped or the channel closes.
    pub async fn subscribe(&self) -> Result<JoinHandle<()>, StoreError> {
        let Some(channel) = self.channel().await else {
            return Err(StoreError::NoChannel(self.id().await));
        };
        let mut rx = channel.on(SYNC_PACKET_EVENT).await;
        let weak = Arc::downgrade(&self.inner);

        Ok(tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let store = EntityStore { inner };
                match from_wire::<SyncPacket>(raw) {
                    Ok(packet) => {
                        store.apply_packet(packet).await;
                    }
                    Err(e) => log::warn!("Undecodable sync packet on '{}': {e}", channel.topic()),
                }
            }
        }))
    }

    /// Refetch the entity through the remote and reload it.
    pub async fn invalidate(&self) -> Result<(), StoreError> {
        let Some(remote) = self.inner.remote.clone() else {
            return Err(StoreError::NoRemote(self.id().await));
        };
        let id = {
            let mut state = self.inner.state.write().await;
            state.is_loading = true;
            state.id.clone()
        };

        let fetched = remote.fetch(&id).await;

        let mut state = self.inner.state.write().await;
        state.is_loading = false;
        match fetched {
            Ok(value) => {
                state.value = Some(value);
                state.error = None;
                self.emit(&state, Change::Loaded);
                Ok(())
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("Failed to refetch '{id}': {error}");
                state.error = Some(error.clone());
                self.emit(&state, Change::Failed { error });
                Err(e.into())
            }
        }
    }

    pub async fn set_error(&self, error: Option<String>) {
        let mut state = self.inner.state.write().await;
        state.error = error.clone();
        if let Some(error) = error {
            self.emit(&state, Change::Failed { error });
        }
    }

    /// Rename the entity, in the store and inside its value.
    pub async fn set_id(&self, id: &str) {
        let mut state = self.inner.state.write().await;
        let previous = std::mem::replace(&mut state.id, id.to_string());
        if let Some(value) = state.value.as_mut() {
            value.set_id(id);
        }
        self.emit(&state, Change::Rekeyed { previous });
    }

    fn emit(&self, state: &State<T>, change: Change) {
        // No receivers is fine.
        let _ = self.inner.events.send(StoreEvent {
            entity_id: state.id.clone(),
            version: state.version,
            change,
        });
    }
}

/// Publish one operation on `channel` and return the assigned version.
pub(crate) async fn publish(
    channel: &ChannelHandle,
    entity_id: &str,
    operation: &Operation,
) -> Result<Version, StoreError> {
    let payload = to_wire(&Envelope::entity(entity_id, operation.clone()))?;
    let response = channel.push(SYNC_PACKET_EVENT, payload).await?;
    Ok(from_wire::<Ack>(response)?.version)
}

fn patched<T: Entity>(value: &T, operation: &Operation) -> Result<T, StoreError> {
    let base = to_wire(value)?;
    let next = operation.apply_to(&base)?;
    Ok(from_wire(next)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use entsync_core::patch::PatchOp;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Organization {
        id: String,
        name: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    impl Entity for Organization {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn set_id(&mut self, id: &str) {
            self.id = id.to_string();
        }
    }

    fn acme() -> Organization {
        Organization {
            id: "org-1".into(),
            name: "Acme".into(),
            tags: vec![],
        }
    }

    #[derive(Default)]
    struct MockRemote {
        ack: Option<Version>,
        fail: bool,
        gate: Option<Arc<Notify>>,
        /// Only updates to this name wait on `gate`; `None` holds every call.
        hold: Option<String>,
        /// Reject updates to this name.
        reject: Option<String>,
        calls: AtomicUsize,
        fetched: Option<Organization>,
    }

    #[async_trait]
    impl Remote<Organization> for MockRemote {
        async fn persist(
            &self,
            _entity_id: &str,
            _operation: &Operation,
            value: &Organization,
        ) -> Result<Option<Ack>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let held = self.hold.as_deref().map_or(true, |name| name == value.name);
            if let (Some(gate), true) = (&self.gate, held) {
                gate.notified().await;
            }
            if self.fail || self.reject.as_deref() == Some(value.name.as_str()) {
                return Err(RemoteError::failed("persist rejected"));
            }
            Ok(self.ack.map(|version| Ack { version }))
        }

        async fn fetch(&self, id: &str) -> Result<Organization, RemoteError> {
            self.fetched
                .clone()
                .ok_or_else(|| RemoteError::failed(format!("{id} not found")))
        }
    }

    fn store_with(remote: MockRemote, config: StoreConfig) -> (EntityStore<Organization>, Arc<MockRemote>) {
        let remote = Arc::new(remote);
        let context = StoreContext::default()
            .with_remote(remote.clone())
            .with_config(config);
        (EntityStore::with_value(acme(), 3, context), remote)
    }

    fn rename_packet(version: Version, name: &str) -> SyncPacket {
        SyncPacket {
            version,
            entity_id: "org-1".into(),
            operation: Operation::new(
                version - 1,
                vec![PatchOp::Update {
                    path: vec!["name".into()],
                    value: json!(name),
                    old_value: None,
                }],
            ),
        }
    }

    fn tag_packet(version: Version) -> SyncPacket {
        SyncPacket {
            version,
            entity_id: "org-1".into(),
            operation: Operation::new(
                version - 1,
                vec![PatchOp::Add {
                    path: vec!["tags".into(), 0usize.into()],
                    value: json!("vip"),
                }],
            ),
        }
    }

    #[tokio::test]
    async fn test_update_acknowledged_advances_version() {
        let (store, remote) = store_with(
            MockRemote {
                ack: Some(4),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        // Optimistic value is visible before the ack.
        assert_eq!(store.value().await.unwrap().name, "Acme Corp");

        assert_eq!(pending.wait().await.unwrap(), 4);
        assert_eq!(store.value().await.unwrap().name, "Acme Corp");
        assert_eq!(store.version().await, 4);
        assert_eq!(store.error().await, None);
        assert_eq!(store.history().await.len(), 1);
        assert_eq!(store.sync_state().await, SyncState::Stable);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_rejected_rolls_back() {
        let (store, _) = store_with(
            MockRemote {
                fail: true,
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert!(pending.wait().await.is_err());

        assert_eq!(store.value().await.unwrap(), acme());
        assert_eq!(store.version().await, 3);
        assert!(store.error().await.is_some());
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_applies_newer_version() {
        let store = EntityStore::with_value(
            Organization {
                name: "Acme Corp".into(),
                ..acme()
            },
            4,
            StoreContext::default(),
        );

        let outcome = store.apply_packet(rename_packet(5, "Acme International")).await;
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(store.value().await.unwrap().name, "Acme International");
        assert_eq!(store.version().await, 5);
    }

    #[tokio::test]
    async fn test_echo_is_stale() {
        let store = EntityStore::with_value(acme(), 5, StoreContext::default());
        assert_eq!(store.apply_packet(rename_packet(5, "Echo")).await, ApplyOutcome::Stale);
        assert_eq!(store.apply_packet(rename_packet(2, "Old")).await, ApplyOutcome::Stale);
        assert_eq!(store.value().await.unwrap().name, "Acme");
    }

    #[tokio::test]
    async fn test_packet_for_other_entity_ignored() {
        let store = EntityStore::with_value(acme(), 0, StoreContext::default());
        let mut packet = rename_packet(1, "Other");
        packet.entity_id = "org-2".into();
        assert_eq!(store.apply_packet(packet).await, ApplyOutcome::Ignored);

        let empty: EntityStore<Organization> = EntityStore::new("org-1", StoreContext::default());
        assert_eq!(empty.apply_packet(rename_packet(1, "x")).await, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_conflicting_packet_is_dropped() {
        let store = EntityStore::with_value(acme(), 1, StoreContext::default());
        let packet = SyncPacket {
            version: 2,
            entity_id: "org-1".into(),
            operation: Operation::new(
                1,
                vec![PatchOp::Update {
                    path: vec!["address".into(), "city".into()],
                    value: json!("Berlin"),
                    old_value: None,
                }],
            ),
        };
        assert_eq!(store.apply_packet(packet).await, ApplyOutcome::Conflict);
        assert_eq!(store.version().await, 1);
        assert_eq!(store.value().await.unwrap(), acme());
    }

    #[tokio::test]
    async fn test_broadcast_wins_while_pending() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert_eq!(store.sync_state().await, SyncState::PendingAck);

        assert_eq!(store.apply_packet(tag_packet(5)).await, ApplyOutcome::Applied);
        assert_eq!(store.value().await.unwrap().tags, vec!["vip".to_string()]);

        gate.notify_one();
        assert_eq!(pending.wait().await.unwrap(), 5);
        let org = store.value().await.unwrap();
        assert_eq!(org.name, "Acme Corp");
        assert_eq!(org.tags, vec!["vip".to_string()]);
        assert_eq!(store.version().await, 5);
    }

    #[tokio::test]
    async fn test_defer_while_pending_queues_until_ack() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig {
                conflict_policy: ConflictPolicy::DeferWhilePending,
                ..StoreConfig::default()
            },
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert_eq!(store.apply_packet(tag_packet(5)).await, ApplyOutcome::Deferred);
        assert!(store.value().await.unwrap().tags.is_empty());

        gate.notify_one();
        pending.wait().await.unwrap();

        let org = store.value().await.unwrap();
        assert_eq!(org.name, "Acme Corp");
        assert_eq!(org.tags, vec!["vip".to_string()]);
        assert_eq!(store.version().await, 5);
    }

    #[tokio::test]
    async fn test_deferred_echo_dropped_after_ack() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig {
                conflict_policy: ConflictPolicy::DeferWhilePending,
                ..StoreConfig::default()
            },
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        // Our own echo, same version as the ack.
        assert_eq!(store.apply_packet(rename_packet(4, "Acme Corp")).await, ApplyOutcome::Deferred);
        gate.notify_one();
        assert_eq!(pending.wait().await.unwrap(), 4);
        assert_eq!(store.version().await, 4);
    }

    #[tokio::test]
    async fn test_rollback_keeps_concurrent_broadcast() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                fail: true,
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        store.apply_packet(tag_packet(5)).await;
        gate.notify_one();
        assert!(pending.wait().await.is_err());

        let org = store.value().await.unwrap();
        assert_eq!(org.name, "Acme");
        assert_eq!(org.tags, vec!["vip".to_string()]);
        assert_eq!(store.version().await, 5);
    }

    #[tokio::test]
    async fn test_broadcast_older_than_ack_still_applies() {
        // Another client was accepted at v5, we were accepted at v6.
        let (store, _) = store_with(
            MockRemote {
                ack: Some(6),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), 6);

        assert_eq!(store.apply_packet(tag_packet(5)).await, ApplyOutcome::Applied);
        let org = store.value().await.unwrap();
        assert_eq!(org.name, "Acme Corp");
        assert_eq!(org.tags, vec!["vip".to_string()]);
        assert_eq!(store.version().await, 6);

        assert_eq!(store.apply_packet(tag_packet(5)).await, ApplyOutcome::Stale);
    }

    #[tokio::test]
    async fn test_deferred_packet_older_than_ack_applies() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(6),
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig {
                conflict_policy: ConflictPolicy::DeferWhilePending,
                ..StoreConfig::default()
            },
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert_eq!(store.apply_packet(tag_packet(5)).await, ApplyOutcome::Deferred);

        gate.notify_one();
        assert_eq!(pending.wait().await.unwrap(), 6);

        let org = store.value().await.unwrap();
        assert_eq!(org.name, "Acme Corp");
        assert_eq!(org.tags, vec!["vip".to_string()]);
        assert_eq!(store.version().await, 6);
    }

    #[tokio::test]
    async fn test_own_echo_before_ack_is_not_reapplied() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        let echo = SyncPacket {
            version: 4,
            entity_id: "org-1".into(),
            operation: store.history().await[0].clone(),
        };
        store
            .update_with(|org| org.name = "Draft".into(), UpdateOptions { mutate: false })
            .await
            .unwrap();

        assert_eq!(store.apply_packet(echo.clone()).await, ApplyOutcome::Stale);
        assert_eq!(store.value().await.unwrap().name, "Draft");

        gate.notify_one();
        assert_eq!(pending.wait().await.unwrap(), 4);
        assert_eq!(store.apply_packet(echo).await, ApplyOutcome::Stale);
        assert_eq!(store.value().await.unwrap().name, "Draft");
    }

    #[tokio::test]
    async fn test_rollback_keeps_same_field_broadcast() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                fail: true,
                gate: Some(gate.clone()),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let pending = store.update(|org| org.name = "Acme Corp".into()).await.unwrap();
        assert_eq!(
            store.apply_packet(rename_packet(5, "Acme International")).await,
            ApplyOutcome::Applied
        );
        gate.notify_one();
        assert!(pending.wait().await.is_err());

        assert_eq!(store.value().await.unwrap().name, "Acme International");
        assert_eq!(store.version().await, 5);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_keeps_later_acknowledged_update() {
        let gate = Arc::new(Notify::new());
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                gate: Some(gate.clone()),
                hold: Some("First".into()),
                reject: Some("First".into()),
                ..Default::default()
            },
            StoreConfig::default(),
        );

        let first = store.update(|org| org.name = "First".into()).await.unwrap();
        let second = store.update(|org| org.name = "Second".into()).await.unwrap();
        assert_eq!(second.wait().await.unwrap(), 4);

        gate.notify_one();
        assert!(first.wait().await.is_err());

        assert_eq!(store.value().await.unwrap().name, "Second");
        assert_eq!(store.version().await, 4);
        let history = store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].diff[0].value(), Some(&json!("Second")));
    }

    #[tokio::test]
    async fn test_local_only_update_skips_remote() {
        let (store, remote) = store_with(MockRemote::default(), StoreConfig::default());

        let pending = store
            .update_with(|org| org.name = "Draft".into(), UpdateOptions { mutate: false })
            .await
            .unwrap();
        assert!(!pending.is_in_flight());
        assert_eq!(pending.wait().await.unwrap(), 3);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.history().await.len(), 1);
        assert_eq!(store.value().await.unwrap().name, "Draft");
    }

    #[tokio::test]
    async fn test_update_without_collaborators_is_immediate() {
        let store = EntityStore::with_value(acme(), 0, StoreContext::default());
        let pending = store.update(|org| org.tags.push("new".into())).await.unwrap();
        assert!(!pending.is_in_flight());
        assert_eq!(store.sync_state().await, SyncState::Stable);
        assert_eq!(store.history().await[0].id, 0);
    }

    #[tokio::test]
    async fn test_update_before_load_fails() {
        let store: EntityStore<Organization> = EntityStore::new("org-1", StoreContext::default());
        assert_eq!(store.sync_state().await, SyncState::Unbootstrapped);
        let err = store.update(|org| org.name.clear()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotBootstrapped(ref id) if id == "org-1"));

        store.load(acme()).await;
        assert!(store.is_bootstrapped().await);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_noop_update_records_nothing() {
        let store = EntityStore::with_value(acme(), 2, StoreContext::default());
        let pending = store.update(|_| {}).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), 2);
        assert!(store.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_versioned_is_monotonic() {
        let store = EntityStore::with_value(acme(), 7, StoreContext::default());
        store.load_versioned(acme(), 3).await;
        assert_eq!(store.version().await, 7);
        store.load_versioned(acme(), 9).await;
        assert_eq!(store.version().await, 9);
    }

    #[tokio::test]
    async fn test_invalidate_refetches() {
        let (store, _) = store_with(
            MockRemote {
                fetched: Some(Organization {
                    name: "Fresh".into(),
                    ..acme()
                }),
                ..Default::default()
            },
            StoreConfig::default(),
        );
        store.invalidate().await.unwrap();
        assert_eq!(store.value().await.unwrap().name, "Fresh");
        assert!(!store.is_loading().await);
    }

    #[tokio::test]
    async fn test_invalidate_failure_sets_error() {
        let (store, _) = store_with(MockRemote::default(), StoreConfig::default());
        assert!(store.invalidate().await.is_err());
        assert!(store.error().await.unwrap().contains("not found"));

        let local = EntityStore::with_value(acme(), 0, StoreContext::default());
        assert!(matches!(local.invalidate().await, Err(StoreError::NoRemote(_))));
    }

    #[tokio::test]
    async fn test_subscribe_without_channel_fails() {
        let store = EntityStore::with_value(acme(), 0, StoreContext::default());
        assert!(matches!(store.subscribe().await, Err(StoreError::NoChannel(_))));
    }

    #[tokio::test]
    async fn test_change_events() {
        let (store, _) = store_with(
            MockRemote {
                ack: Some(4),
                ..Default::default()
            },
            StoreConfig::default(),
        );
        let mut changes = store.changes();

        store
            .update(|org| org.name = "Acme Corp".into())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let optimistic = changes.recv().await.unwrap();
        assert_eq!(optimistic.change, Change::Optimistic);
        assert_eq!(optimistic.version, 3);
        let acked = changes.recv().await.unwrap();
        assert_eq!(acked.change, Change::Acknowledged);
        assert_eq!(acked.version, 4);
    }

    #[tokio::test]
    async fn test_set_id_renames_value() {
        let store = EntityStore::with_value(acme(), 0, StoreContext::default());
        store.set_id("org-99").await;
        assert_eq!(store.id().await, "org-99");
        assert_eq!(store.value().await.unwrap().id, "org-99");
    }
}
