//! Client-side transaction state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use skein_cluster::{Key, SegmentId, Topology, TopologyId, Version};

use crate::message::{TxId, WriteOp};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Preparing => write!(f, "preparing"),
            Self::Prepared => write!(f, "prepared"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled-back"),
        }
    }
}

/// A value observed by the transaction, with the version it had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub value: Option<Bytes>,
    pub version: Version,
}

/// Read-set, write-set and the topology a transaction started under.
///
/// Not `Clone`: `commit` and `rollback` take it by value, so a finished
/// transaction cannot be reused.
#[derive(Debug)]
pub struct TransactionContext {
    id: TxId,
    topology: Arc<Topology>,
    reads: BTreeMap<Key, Observed>,
    writes: BTreeMap<Key, Option<Bytes>>,
    status: TxStatus,
}

impl TransactionContext {
    pub fn new(id: TxId, topology: Arc<Topology>) -> Self {
        Self {
            id,
            topology,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            status: TxStatus::Active,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// The topology snapshot taken at `begin`.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology.id()
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    pub fn is_active(&self) -> bool {
        self.status == TxStatus::Active
    }

    /// Records a read. The first observation of a key wins, so later reads
    /// cannot move the version the commit validates against.
    pub fn observe(&mut self, key: Key, value: Option<Bytes>, version: Version) {
        self.reads
            .entry(key)
            .or_insert(Observed { value, version });
    }

    pub fn observed(&self, key: &Key) -> Option<&Observed> {
        self.reads.get(key)
    }

    /// Buffers a write; `None` removes the key.
    pub fn buffer_write(&mut self, key: Key, value: Option<Bytes>) {
        self.writes.insert(key, value);
    }

    /// The buffered write for `key`, if any. `Some(None)` is a removal.
    pub fn pending_write(&self, key: &Key) -> Option<&Option<Bytes>> {
        self.writes.get(key)
    }

    pub fn reads(&self) -> &BTreeMap<Key, Observed> {
        &self.reads
    }

    pub fn writes(&self) -> &BTreeMap<Key, Option<Bytes>> {
        &self.writes
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Segments of every key read or written, under the start topology.
    pub fn touched_segments(&self) -> BTreeSet<SegmentId> {
        self.reads
            .keys()
            .chain(self.writes.keys())
            .map(|k| self.topology.segment_of(k))
            .collect()
    }

    /// Segments of the written keys.
    pub fn written_segments(&self) -> BTreeSet<SegmentId> {
        self.writes
            .keys()
            .map(|k| self.topology.segment_of(k))
            .collect()
    }

    /// Groups the write-set by segment as unversioned write ops.
    pub fn writes_by_segment(&self) -> BTreeMap<SegmentId, Vec<WriteOp>> {
        let mut grouped: BTreeMap<SegmentId, Vec<WriteOp>> = BTreeMap::new();
        for (key, value) in &self.writes {
            grouped
                .entry(self.topology.segment_of(key))
                .or_default()
                .push(WriteOp {
                    key: key.clone(),
                    value: value.clone(),
                    version: None,
                });
        }
        grouped
    }

    /// Versions observed for the given written keys, as sent to each
    /// primary for validation. Keys written without being read are left out,
    /// and so are keys that were only read: write skew is checked on the
    /// write-set, so a read-only key never aborts a commit.
    pub fn observed_versions<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a Key>,
    ) -> BTreeMap<Key, Version> {
        keys.into_iter()
            .filter_map(|k| self.reads.get(k).map(|o| (k.clone(), o.version)))
            .collect()
    }
}
