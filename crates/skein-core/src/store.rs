//! The local versioned entry store.
//!
//! Holds this node's copy of every segment it owns. All mutations go through
//! either [`compare_and_set`](VersionedEntryStore::compare_and_set), used by
//! a primary that assigns versions, or
//! [`apply_versioned`](VersionedEntryStore::apply_versioned), used for
//! entries whose version was assigned elsewhere. Both run under the DashMap
//! shard lock for the key, so they are atomic per key.
//!
//! Keys are also indexed by segment so a transfer pages through one segment
//! without scanning the rest of the map.

use std::collections::BTreeSet;
use std::ops::Bound;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use skein_cluster::{HashLayout, Key, SegmentId, TransferBatch, Version};

/// A live value together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: Version,
}

/// Result of a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    pub ok: bool,
    /// The new version on success, the unchanged current version on failure.
    pub version: Version,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    /// `None` marks a tombstone.
    value: Option<Bytes>,
    version: Version,
}

/// Concurrent map from key to `(value | tombstone, version)`.
#[derive(Debug)]
pub struct VersionedEntryStore {
    layout: HashLayout,
    entries: DashMap<Key, StoredEntry>,
    /// Stored keys per segment, tombstones included.
    segments: DashMap<SegmentId, BTreeSet<Key>>,
}

impl VersionedEntryStore {
    pub fn new(layout: HashLayout) -> Self {
        Self {
            layout,
            entries: DashMap::new(),
            segments: DashMap::new(),
        }
    }

    pub fn layout(&self) -> HashLayout {
        self.layout
    }

    /// Returns the live value, or `None` for absent and removed keys.
    pub fn get(&self, key: &Key) -> Option<VersionedValue> {
        let entry = self.entries.get(key)?;
        let value = entry.value.clone()?;
        Some(VersionedValue {
            value,
            version: entry.version,
        })
    }

    /// Returns the value (if live) and the version, tombstones included.
    /// Absent keys report [`Version::NEVER_WRITTEN`].
    pub fn read(&self, key: &Key) -> (Option<Bytes>, Version) {
        match self.entries.get(key) {
            Some(e) => (e.value.clone(), e.version),
            None => (None, Version::NEVER_WRITTEN),
        }
    }

    pub fn version_of(&self, key: &Key) -> Version {
        self.entries
            .get(key)
            .map(|e| e.version)
            .unwrap_or(Version::NEVER_WRITTEN)
    }

    /// Writes `value` (or a tombstone for `None`) iff the current version
    /// equals `expected`. The new version is `expected + 1`.
    pub fn compare_and_set(&self, key: Key, expected: Version, value: Option<Bytes>) -> CasOutcome {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if current != expected {
                    return CasOutcome {
                        ok: false,
                        version: current,
                    };
                }
                let version = expected.next();
                occupied.insert(StoredEntry { value, version });
                CasOutcome { ok: true, version }
            }
            Entry::Vacant(vacant) => {
                if !expected.is_never_written() {
                    return CasOutcome {
                        ok: false,
                        version: Version::NEVER_WRITTEN,
                    };
                }
                self.index(vacant.key());
                let version = expected.next();
                vacant.insert(StoredEntry { value, version });
                CasOutcome { ok: true, version }
            }
        }
    }

    /// Installs an entry whose version was assigned by another node. Older
    /// or equal versions are ignored; returns whether the entry was written.
    pub fn apply_versioned(&self, key: Key, value: Option<Bytes>, version: Version) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version >= version {
                    return false;
                }
                occupied.insert(StoredEntry { value, version });
                true
            }
            Entry::Vacant(vacant) => {
                self.index(vacant.key());
                vacant.insert(StoredEntry { value, version });
                true
            }
        }
    }

    // called with the key's entry shard held; nothing locks `entries`
    // while holding an index shard
    fn index(&self, key: &Key) {
        self.segments
            .entry(self.layout.segment_of(key))
            .or_default()
            .insert(key.clone());
    }

    /// Collects up to `limit` entries of `segment` with keys strictly
    /// greater than `after`, in key order.
    pub fn segment_batch(
        &self,
        segment: SegmentId,
        after: Option<&Key>,
        limit: usize,
    ) -> TransferBatch {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        // one extra key tells whether another batch follows
        let keys: Vec<Key> = match self.segments.get(&segment) {
            Some(keys) => keys
                .range::<Key, _>((lower, Bound::Unbounded))
                .take(limit + 1)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let mut batch = TransferBatch::new(segment);
        batch.done = keys.len() <= limit;
        for key in keys.into_iter().take(limit) {
            // the entry may have been dropped since the index was read
            if let Some(e) = self.entries.get(&key) {
                let (value, version) = (e.value.clone(), e.version);
                drop(e);
                batch.push(key, value, version);
            }
        }
        batch
    }

    /// Keys currently stored for a segment, tombstones included.
    pub fn segment_keys(&self, segment: SegmentId) -> Vec<Key> {
        self.segments
            .get(&segment)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every entry of a segment. Returns the number removed.
    pub fn drop_segment(&self, segment: SegmentId) -> usize {
        let Some((_, keys)) = self.segments.remove(&segment) else {
            return 0;
        };
        keys.iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count()
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live (non-tombstone) entries.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }
}
