//! Topic fan-out for the sync backend.
//!
//! Uses tokio broadcast channels for O(1) send to all members of a topic.
//! Each member gets an independent receiver that buffers up to `capacity`
//! pre-encoded frames; a lagging member drops the oldest frames.
//!
//! Every topic also owns the version counters it hands out: one per entity
//! id for `sync_packet`, and one for the collection as a whole.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use entsync_core::protocol::Version;

use crate::frame::Frame;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_members: usize,
    pub entities_tracked: usize,
    pub group_version: Version,
}

/// A broadcast group for a single topic.
pub struct TopicGroup {
    name: String,
    sender: broadcast::Sender<Arc<String>>,
    members: RwLock<HashSet<Uuid>>,
    entity_versions: Mutex<HashMap<String, Version>>,
    group_version: Mutex<Version>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl TopicGroup {
    /// Create a new topic group with the given buffer capacity.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            members: RwLock::new(HashSet::new()),
            entity_versions: Mutex::new(HashMap::new()),
            group_version: Mutex::new(0),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a connection to the topic and return its receiver.
    pub async fn add_member(&self, connection_id: Uuid) -> broadcast::Receiver<Arc<String>> {
        self.members.write().await.insert(connection_id);
        self.sender.subscribe()
    }

    /// Remove a connection from the topic.
    pub async fn remove_member(&self, connection_id: &Uuid) -> bool {
        self.members.write().await.remove(connection_id)
    }

    pub async fn has_member(&self, connection_id: &Uuid) -> bool {
        self.members.read().await.contains(connection_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Broadcast a frame to every member, the publisher included.
    ///
    /// Returns the number of receivers that got it.
    pub fn broadcast(&self, frame: &Frame) -> Result<usize, entsync_core::ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Assign the next version for `entity_id`.
    ///
    /// `based_on` is the version the client computed its diff against; the
    /// counter never goes below it so clients that bootstrapped from a
    /// snapshot never see versions older than the one they already hold.
    pub async fn next_entity_version(&self, entity_id: &str, based_on: Version) -> Version {
        let mut versions = self.entity_versions.lock().await;
        let counter = versions.entry(entity_id.to_string()).or_insert(0);
        *counter = (*counter).max(based_on) + 1;
        *counter
    }

    /// Assign the next collection-level version.
    pub async fn next_group_version(&self, based_on: Version) -> Version {
        let mut version = self.group_version.lock().await;
        *version = (*version).max(based_on) + 1;
        *version
    }

    pub async fn entity_version(&self, entity_id: &str) -> Option<Version> {
        self.entity_versions.lock().await.get(entity_id).copied()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
            entities_tracked: self.entity_versions.lock().await.len(),
            group_version: *self.group_version.lock().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to broadcast groups.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `topic`.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        if let Some(group) = self.topics.read().await.get(topic) {
            return group.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicGroup::new(topic, self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Drop a topic that has no members left.
    ///
    /// Version counters go with it, which is fine because the next writer
    /// reseeds them from its own `Operation::id`.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.member_count().await == 0 {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
