//! Node-to-node request and response types.
//!
//! Every message derives serde so that any transport can carry it; the
//! in-process network moves them as plain values.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use skein_cluster::{Key, NodeId, SegmentId, TopologyId, TransferBatch, Version};

/// Cluster-unique transaction id: the originating node plus a local
/// sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId {
    pub origin: NodeId,
    pub seq: u64,
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.origin, self.seq)
    }
}

/// A buffered write sent to a segment's owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    pub key: Key,
    /// `None` removes the key.
    pub value: Option<Bytes>,
    /// Version pinned by the primary. Unset in primary prepares, set in
    /// backup prepares.
    pub version: Option<Version>,
}

/// Which replica a prepare is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareRole {
    /// Validates versions and assigns new ones.
    Primary,
    /// Locks and stores the versions the primary assigned.
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub tx: TxId,
    pub topology_id: TopologyId,
    pub segment: SegmentId,
    pub role: PrepareRole,
    pub writes: Vec<WriteOp>,
    /// Versions the transaction observed for the keys it writes. Keys
    /// written blind are absent and are not validated.
    pub observed: BTreeMap<Key, Version>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Read {
        segment: SegmentId,
        key: Key,
        topology_id: TopologyId,
    },
    Prepare(PrepareRequest),
    /// Apply the prepared writes of `segments`.
    Commit {
        tx: TxId,
        segments: Vec<SegmentId>,
    },
    Rollback {
        tx: TxId,
    },
    /// Fetch the next batch of a segment, resuming after `after`.
    TransferPull {
        segment: SegmentId,
        topology_id: TopologyId,
        after: Option<Key>,
        limit: usize,
    },
    /// `node` finished pulling `segment` under `topology_id`.
    TransferConfirm {
        segment: SegmentId,
        topology_id: TopologyId,
        node: NodeId,
    },
}

impl Request {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Prepare(_) => "prepare",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::TransferPull { .. } => "transfer-pull",
            Self::TransferConfirm { .. } => "transfer-confirm",
        }
    }
}

/// Why a participant refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    VersionMismatch {
        key: Key,
        expected: Version,
        found: Version,
    },
    LockBusy {
        key: Key,
        holder: TxId,
    },
    TopologyMismatch {
        expected: TopologyId,
        actual: TopologyId,
    },
    SegmentTransferring {
        segment: SegmentId,
    },
    NotOwner {
        segment: SegmentId,
    },
    /// The prepare expired and its locks were released.
    TimedOut,
    AlreadyRolledBack,
    /// The segment has not arrived at this owner yet.
    NotReady {
        segment: SegmentId,
    },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionMismatch {
                key,
                expected,
                found,
            } => write!(f, "version mismatch on '{key}': expected {expected}, found {found}"),
            Self::LockBusy { key, holder } => write!(f, "'{key}' is locked by {holder}"),
            Self::TopologyMismatch { expected, actual } => {
                write!(f, "topology {expected} requested, node is at {actual}")
            }
            Self::SegmentTransferring { segment } => {
                write!(f, "segment {segment} is transferring")
            }
            Self::NotOwner { segment } => write!(f, "not an owner of segment {segment}"),
            Self::TimedOut => write!(f, "prepare timed out"),
            Self::AlreadyRolledBack => write!(f, "already rolled back"),
            Self::NotReady { segment } => write!(f, "segment {segment} not yet received"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Value (absent or tombstone as `None`) and version of a key.
    Value {
        value: Option<Bytes>,
        version: Version,
    },
    /// Prepare accepted; the versions each key will carry once committed.
    Prepared {
        versions: BTreeMap<Key, Version>,
    },
    Rejected(Rejection),
    Ack,
    Batch(TransferBatch),
    /// The node does not hold the requested segment.
    NotHolder,
}
