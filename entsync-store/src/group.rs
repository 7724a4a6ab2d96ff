//! Group store: the identity map for one entity type.
//!
//! Owns bulk load and pagination, collection-level APPEND/REMOVE/INVALIDATE,
//! temporary-id creation and the single topic subscription shared by every
//! member store.
//!
//! ```text
//!  topic ──► subscribe task ──┬── sync_packet       → members[entity_id].apply_packet
//!                             └── sync_group_packet → apply_group_packet
//!
//!  create(v) ──► "new-<uuid>" in map ──► Remote::create ──► re-key to server id ──► sync(APPEND)
//! ```

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use entsync_channel::connection::ChannelHandle;
use entsync_core::protocol::{
    from_wire, to_wire, Ack, Envelope, GroupAction, GroupOperation, GroupSyncPacket, SyncPacket,
    Version, SYNC_GROUP_PACKET_EVENT, SYNC_PACKET_EVENT,
};

use crate::entity::{ApplyOutcome, EntityStore, Pending, StoreConfig, StoreContext, StoreError};
use crate::event::GroupEvent;
use crate::ledger::SeenVersions;
use crate::remote::{Entity, Remote};

/// Prefix of client-generated ids.
pub const TEMP_ID_PREFIX: &str = "new-";

/// Group store configuration.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Page size for `bootstrap` and `bootstrap_rest`
    pub page_limit: usize,
    /// Buffered events per `changes()` receiver
    pub event_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Refetch the new entity this long after the server confirms it.
    pub invalidate_after: Option<Duration>,
}

/// Whether `id` was generated locally and not yet confirmed.
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

fn temporary_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

struct GroupState<T: Entity> {
    value: IndexMap<String, EntityStore<T>>,
    version: Version,
    seen: SeenVersions,
    history: Vec<GroupOperation>,
    is_bootstrapped: bool,
    is_loading: bool,
    total_elements: usize,
    error: Option<String>,
}

struct GroupInner<T: Entity> {
    state: RwLock<GroupState<T>>,
    remote: Option<Arc<dyn Remote<T>>>,
    channel: RwLock<Option<ChannelHandle>>,
    store_config: StoreConfig,
    config: GroupConfig,
    events: broadcast::Sender<GroupEvent>,
}

/// Keyed collection of entity stores for one entity type.
pub struct GroupStore<T: Entity> {
    inner: Arc<GroupInner<T>>,
}

impl<T: Entity> Clone for GroupStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> GroupStore<T> {
    /// `context` is shared with every member store.
    pub fn new(context: StoreContext<T>, config: GroupConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(GroupInner {
                state: RwLock::new(GroupState {
                    value: IndexMap::new(),
                    version: 0,
                    seen: SeenVersions::default(),
                    history: Vec::new(),
                    is_bootstrapped: false,
                    is_loading: false,
                    total_elements: 0,
                    error: None,
                }),
                remote: context.remote,
                channel: RwLock::new(context.channel),
                store_config: context.config,
                config,
                events,
            }),
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.inner.config
    }

    pub fn changes(&self) -> broadcast::Receiver<GroupEvent> {
        self.inner.events.subscribe()
    }

    pub async fn channel(&self) -> Option<ChannelHandle> {
        self.inner.channel.read().await.clone()
    }

    /// Attach the topic to the group and to every member.
    pub async fn attach_channel(&self, channel: ChannelHandle) {
        *self.inner.channel.write().await = Some(channel.clone());
        for store in self.members().await {
            store.attach_channel(channel.clone()).await;
        }
    }

    async fn member_context(&self) -> StoreContext<T> {
        StoreContext {
            remote: self.inner.remote.clone(),
            channel: self.channel().await,
            config: self.inner.store_config.clone(),
        }
    }

    async fn members(&self) -> Vec<EntityStore<T>> {
        self.inner.state.read().await.value.values().cloned().collect()
    }

    fn emit(&self, event: GroupEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Register items that are not in the map yet.
    ///
    /// Existing stores are left untouched, so repeated loads never clobber
    /// local edits. Returns the newly registered ids.
    pub async fn load(&self, items: Vec<T>) -> Vec<String> {
        let context = self.member_context().await;
        let mut state = self.inner.state.write().await;

        let mut added = Vec::new();
        for item in items {
            let id = item.id();
            if state.value.contains_key(&id) {
                continue;
            }
            state
                .value
                .insert(id.clone(), EntityStore::with_value(item, 0, context.clone()));
            added.push(id);
        }
        drop(state);

        if !added.is_empty() {
            log::debug!("Loaded {} new entities", added.len());
            self.emit(GroupEvent::Loaded { ids: added.clone() });
        }
        added
    }

    /// Record a collection-level operation and publish it on the topic.
    ///
    /// `REMOVE` drops the ids locally first. Without a channel the operation
    /// stays local.
    pub async fn sync(&self, action: GroupAction, ids: Vec<String>) -> Result<Version, StoreError> {
        let channel = self.channel().await;
        let operation = {
            let mut state = self.inner.state.write().await;
            if action == GroupAction::Remove {
                for id in &ids {
                    state.value.shift_remove(id);
                }
            }
            let operation = GroupOperation {
                id: state.version,
                action,
                ids,
            };
            state.history.push(operation.clone());
            operation
        };

        let Some(channel) = channel else {
            let version = self.version().await;
            self.emit(GroupEvent::Synced {
                action,
                ids: operation.ids,
                version,
            });
            return Ok(version);
        };

        let published = publish_group(&channel, &operation).await;

        let mut state = self.inner.state.write().await;
        match published {
            Ok(version) => {
                state.seen.insert(version);
                state.version = state.version.max(version);
                let version = state.version;
                drop(state);
                log::debug!("{action:?} of {} ids synced at version {version}", operation.ids.len());
                self.emit(GroupEvent::Synced {
                    action,
                    ids: operation.ids,
                    version,
                });
                Ok(version)
            }
            Err(e) => {
                if let Some(index) = state.history.iter().rposition(|op| *op == operation) {
                    state.history.remove(index);
                }
                let error = e.to_string();
                log::error!("Failed to sync {action:?} on '{}': {error}", channel.topic());
                state.error = Some(error.clone());
                drop(state);
                self.emit(GroupEvent::Failed { error });
                Err(e)
            }
        }
    }

    /// Apply another client's collection-level operation.
    ///
    /// Packets may arrive below the current version when our own ack
    /// overtook them; only versions already seen are skipped. Applying our
    /// own echo before its ack is harmless since every action is idempotent.
    pub async fn apply_group_packet(&self, packet: GroupSyncPacket) -> ApplyOutcome {
        let GroupSyncPacket { version, operation } = packet;

        let targets: Vec<String> = {
            let mut state = self.inner.state.write().await;
            if state.seen.contains(version) {
                log::trace!("Skipping seen group packet v{version}");
                return ApplyOutcome::Stale;
            }
            state.seen.insert(version);
            state.version = state.version.max(version);
            match operation.action {
                GroupAction::Remove => {
                    for id in &operation.ids {
                        state.value.shift_remove(id);
                    }
                    Vec::new()
                }
                GroupAction::Append => operation
                    .ids
                    .iter()
                    .filter(|id| !state.value.contains_key(id.as_str()))
                    .cloned()
                    .collect(),
                GroupAction::Invalidate => operation
                    .ids
                    .iter()
                    .filter(|id| state.value.contains_key(id.as_str()))
                    .cloned()
                    .collect(),
            }
        };

        match operation.action {
            GroupAction::Append => self.fetch_missing(&targets).await,
            GroupAction::Invalidate => {
                for id in &targets {
                    if let Some(store) = self.get(id).await {
                        if let Err(e) = store.invalidate().await {
                            log::warn!("Failed to refetch '{id}': {e}");
                        }
                    }
                }
            }
            GroupAction::Remove => {}
        }

        self.emit(GroupEvent::Synced {
            action: operation.action,
            ids: operation.ids,
            version,
        });
        ApplyOutcome::Applied
    }

    async fn fetch_missing(&self, ids: &[String]) {
        let Some(remote) = self.inner.remote.clone() else {
            log::debug!("No remote to fetch {} appended entities", ids.len());
            return;
        };

        let mut fetched = Vec::new();
        for id in ids {
            match remote.fetch(id).await {
                Ok(value) => fetched.push(value),
                Err(e) => log::warn!("Failed to fetch appended entity '{id}': {e}"),
            }
        }
        self.load(fetched).await;
    }

    /// Route an entity broadcast to its member store.
    pub async fn apply_packet(&self, packet: SyncPacket) -> ApplyOutcome {
        match self.get(&packet.entity_id).await {
            Some(store) => store.apply_packet(packet).await,
            None => {
                log::trace!("Sync packet for unknown entity '{}'", packet.entity_id);
                ApplyOutcome::Ignored
            }
        }
    }

    /// Listen for both entity and group broadcasts on the topic.
    pub async fn subscribe(&self) -> Result<JoinHandle<()>, StoreError> {
        let Some(channel) = self.channel().await else {
            return Err(StoreError::NoChannel(String::from("group")));
        };
        let mut entity_rx = channel.on(SYNC_PACKET_EVENT).await;
        let mut group_rx = channel.on(SYNC_GROUP_PACKET_EVENT).await;
        let weak = Arc::downgrade(&self.inner);
        let topic = channel.topic().to_string();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(raw) = entity_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        match from_wire::<SyncPacket>(raw) {
                            Ok(packet) => {
                                GroupStore { inner }.apply_packet(packet).await;
                            }
                            Err(e) => log::warn!("Undecodable sync packet on '{topic}': {e}"),
                        }
                    }
                    Some(raw) = group_rx.recv() => {
                        let Some(inner) = weak.upgrade() else { break };
                        match from_wire::<GroupSyncPacket>(raw) {
                            Ok(packet) => {
                                GroupStore { inner }.apply_group_packet(packet).await;
                            }
                            Err(e) => log::warn!("Undecodable group packet on '{topic}': {e}"),
                        }
                    }
                    else => break,
                }
            }
        }))
    }

    /// Insert `value` under a temporary id and create it remotely.
    ///
    /// The temporary id is returned at once; the handle resolves to the
    /// server id after the entry has been re-keyed and `APPEND` synced. On
    /// failure the temporary entry stays in the map with its error set.
    pub async fn create(&self, mut value: T, options: CreateOptions) -> (String, Pending<String>) {
        let temp_id = temporary_id();
        value.set_id(&temp_id);

        let context = self.member_context().await;
        let store = EntityStore::with_value(value.clone(), 0, context);
        self.inner
            .state
            .write()
            .await
            .value
            .insert(temp_id.clone(), store.clone());
        log::debug!("Created '{temp_id}' locally");

        if self.inner.remote.is_none() {
            return (temp_id.clone(), Pending::ready(Ok(temp_id)));
        }

        let group = self.clone();
        let id = temp_id.clone();
        let handle = tokio::spawn(async move { group.confirm_create(id, store, value, options).await });
        (temp_id, Pending::in_flight(handle))
    }

    async fn confirm_create(
        &self,
        temp_id: String,
        store: EntityStore<T>,
        value: T,
        options: CreateOptions,
    ) -> Result<String, StoreError> {
        let Some(remote) = self.inner.remote.clone() else {
            return Ok(temp_id);
        };

        let server_id = match remote.create(&value).await {
            Ok(server_id) => server_id,
            Err(e) => {
                let error = e.to_string();
                log::error!("Failed to create '{temp_id}': {error}");
                store.set_error(Some(error.clone())).await;
                self.inner.state.write().await.error = Some(error.clone());
                self.emit(GroupEvent::Failed { error });
                return Err(e.into());
            }
        };

        store.set_id(&server_id).await;
        {
            let mut state = self.inner.state.write().await;
            if state.value.shift_remove(&temp_id).is_some() {
                state.value.insert(server_id.clone(), store.clone());
            } else {
                log::warn!("'{temp_id}' was removed before the server confirmed it");
            }
        }
        log::info!("'{temp_id}' confirmed as '{server_id}'");
        self.emit(GroupEvent::Created {
            temp_id,
            id: server_id.clone(),
        });

        if let Err(e) = self.sync(GroupAction::Append, vec![server_id.clone()]).await {
            log::warn!("Created '{server_id}' but APPEND sync failed: {e}");
        }

        if let Some(delay) = options.invalidate_after {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = store.invalidate().await {
                    log::warn!("Delayed refetch after create failed: {e}");
                }
            });
        }

        Ok(server_id)
    }

    /// Drop `ids` from the map, remove them remotely and sync `REMOVE`.
    ///
    /// Entries are not restored if the remote call fails.
    pub async fn remove(&self, ids: Vec<String>) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.write().await;
            for id in &ids {
                state.value.shift_remove(id);
            }
        }

        if let Some(remote) = self.inner.remote.clone() {
            if let Err(e) = remote.remove(&ids).await {
                let error = e.to_string();
                log::error!("Failed to remove {} entities: {error}", ids.len());
                self.inner.state.write().await.error = Some(error.clone());
                self.emit(GroupEvent::Failed { error });
                return Err(e.into());
            }
        }

        self.sync(GroupAction::Remove, ids).await.map(|_| ())
    }

    /// Load the first page. No-op when already bootstrapped or loading.
    ///
    /// A failed attempt still marks the group bootstrapped so views do not
    /// refetch on every mount; `error` carries the failure and
    /// [`retry_bootstrap`](Self::retry_bootstrap) tries again.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        let Some(remote) = self.inner.remote.clone() else {
            return Err(StoreError::NoRemote(String::from("group")));
        };
        {
            let mut state = self.inner.state.write().await;
            if state.is_bootstrapped || state.is_loading {
                return Ok(());
            }
            state.is_loading = true;
        }

        let page = remote.list(0, self.inner.config.page_limit).await;

        match page {
            Ok(page) => {
                self.load(page.items).await;
                let mut state = self.inner.state.write().await;
                state.total_elements = page.total_elements;
                state.is_bootstrapped = true;
                state.is_loading = false;
                state.error = None;
                log::info!(
                    "Bootstrapped {} of {} entities",
                    state.value.len(),
                    state.total_elements
                );
                Ok(())
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("Bootstrap failed: {error}");
                {
                    let mut state = self.inner.state.write().await;
                    state.is_bootstrapped = true;
                    state.is_loading = false;
                    state.error = Some(error.clone());
                }
                self.emit(GroupEvent::Failed { error });
                Err(e.into())
            }
        }
    }

    /// Clear the bootstrapped flag and load the first page again.
    pub async fn retry_bootstrap(&self) -> Result<(), StoreError> {
        {
            let mut state = self.inner.state.write().await;
            if state.is_loading {
                return Ok(());
            }
            state.is_bootstrapped = false;
        }
        self.bootstrap().await
    }

    /// Keep fetching pages until every element is loaded.
    ///
    /// Stops at the first failing or empty page.
    pub async fn bootstrap_rest(&self) -> Result<(), StoreError> {
        self.bootstrap().await?;
        let Some(remote) = self.inner.remote.clone() else {
            return Err(StoreError::NoRemote(String::from("group")));
        };
        let limit = self.inner.config.page_limit;

        // Resume after what is loaded; a failed first page restarts at 0.
        let mut page = self.len().await / limit.max(1);
        while !self.is_fully_loaded().await {
            match remote.list(page, limit).await {
                Ok(next) => {
                    if next.items.is_empty() {
                        log::debug!("Page {page} came back empty, stopping");
                        break;
                    }
                    self.load(next.items).await;
                    self.inner.state.write().await.total_elements = next.total_elements;
                    page += 1;
                }
                Err(e) => {
                    let error = e.to_string();
                    log::error!("Failed to load page {page}: {error}");
                    self.inner.state.write().await.error = Some(error.clone());
                    self.emit(GroupEvent::Failed { error });
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    pub async fn is_fully_loaded(&self) -> bool {
        let state = self.inner.state.read().await;
        state.value.len() >= state.total_elements
    }

    pub async fn get(&self, id: &str) -> Option<EntityStore<T>> {
        self.inner.state.read().await.value.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.state.read().await.value.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.value.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.read().await.value.is_empty()
    }

    /// Ids in insertion order.
    pub async fn ids(&self) -> Vec<String> {
        self.inner.state.read().await.value.keys().cloned().collect()
    }

    /// Snapshot of every loaded value, in insertion order.
    pub async fn to_vec(&self) -> Vec<T> {
        let mut values = Vec::new();
        for store in self.members().await {
            if let Some(value) = store.value().await {
                values.push(value);
            }
        }
        values
    }

    /// Map every loaded value through `f`.
    pub async fn to_computed_vec<R, F>(&self, f: F) -> Vec<R>
    where
        F: Fn(&T) -> R,
    {
        self.to_vec().await.iter().map(f).collect()
    }

    pub async fn version(&self) -> Version {
        self.inner.state.read().await.version
    }

    pub async fn history(&self) -> Vec<GroupOperation> {
        self.inner.state.read().await.history.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.inner.state.read().await.error.clone()
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.inner.state.read().await.is_bootstrapped
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.state.read().await.is_loading
    }

    pub async fn total_elements(&self) -> usize {
        self.inner.state.read().await.total_elements
    }
}

async fn publish_group(channel: &ChannelHandle, operation: &GroupOperation) -> Result<Version, StoreError> {
    let payload = to_wire(&Envelope::group(operation.clone()))?;
    let response = channel.push(SYNC_GROUP_PACKET_EVENT, payload).await?;
    Ok(from_wire::<Ack>(response)?.version)
}
