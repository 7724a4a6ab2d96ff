//! Which server versions a store already reflects.
//!
//! Acks can jump past versions this client has not received yet (another
//! client's op accepted at v5, ours at v6), so "already applied" is a set
//! of versions, not a high-water mark. Everything at or below `floor` is
//! reflected; `above` holds the sparse versions past it.

use std::collections::BTreeSet;

use entsync_core::protocol::Version;

#[derive(Debug, Clone, Default)]
pub(crate) struct SeenVersions {
    floor: Version,
    above: BTreeSet<Version>,
}

impl SeenVersions {
    /// Start from a snapshot that already contains every version up to `floor`.
    pub(crate) fn new(floor: Version) -> Self {
        Self {
            floor,
            above: BTreeSet::new(),
        }
    }

    pub(crate) fn contains(&self, version: Version) -> bool {
        version <= self.floor || self.above.contains(&version)
    }

    pub(crate) fn insert(&mut self, version: Version) {
        if version > self.floor {
            self.above.insert(version);
            self.compact();
        }
    }

    /// A snapshot at `version` covers everything up to it.
    pub(crate) fn raise_floor(&mut self, version: Version) {
        if version > self.floor {
            self.floor = version;
            self.above.retain(|v| *v > version);
            self.compact();
        }
    }

    fn compact(&mut self) {
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}
