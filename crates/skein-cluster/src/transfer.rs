//! Segment transfer bookkeeping.
//!
//! When a topology change reassigns a segment, the new owners that do not
//! already hold it must pull its entries from a surviving holder. This
//! module tracks that process per segment:
//!
//! 1. A topology is applied with [`TransferTable::rebalance`]. Segments whose
//!    owners changed become `Transferring` unless every new owner already
//!    holds the data.
//! 2. Each pending owner pulls the entries in [`TransferBatch`]es from one of
//!    the recorded sources, then broadcasts a confirmation.
//! 3. [`TransferTable::confirm`] records confirmations. Once every pending
//!    owner has confirmed, the segment is `Stable` again and nodes that no
//!    longer own it may drop their copies.
//!
//! The table holds no data and performs no I/O; the node-level transfer
//! manager drives it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::segments::{ConsistentHashView, SegmentId};
use crate::topology::{Topology, TopologyId};
use crate::{Key, NodeId, Version};

/// Transfer state of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Every owner holds the segment's entries.
    Stable,
    /// At least one owner is still pulling.
    Transferring,
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Transferring => write!(f, "transferring"),
        }
    }
}

/// An in-progress transfer of one segment.
#[derive(Debug, Clone)]
pub struct SegmentTransfer {
    pub segment: SegmentId,
    /// Topology the transfer was first started under. A transfer that spans
    /// several topology changes keeps this value.
    pub started_in: TopologyId,
    /// Latest topology the transfer was recomputed for.
    pub topology_id: TopologyId,
    /// Owners before the transfer began.
    pub previous_owners: Vec<NodeId>,
    /// Surviving holders to pull from, primary first.
    pub sources: Vec<NodeId>,
    /// Owners once the transfer completes.
    pub new_owners: Vec<NodeId>,
    /// New owners that have not confirmed yet.
    pub pending: BTreeSet<NodeId>,
    /// New owners that already confirmed.
    pub confirmed: Vec<NodeId>,
    /// Entries pulled so far, as reported by the local puller.
    pub keys_transferred: u64,
    pub started_at: Instant,
}

impl SegmentTransfer {
    /// Returns true if `node` still has to pull this segment.
    pub fn is_pending(&self, node: &NodeId) -> bool {
        self.pending.contains(node)
    }

    /// Nodes holding a complete copy right now.
    pub fn holders(&self) -> impl Iterator<Item = &NodeId> {
        self.sources.iter().chain(self.confirmed.iter())
    }
}

/// A segment whose entries had no surviving holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossReport {
    pub segment: SegmentId,
    pub topology_id: TopologyId,
    /// Holders that disappeared, primary first.
    pub lost_holders: Vec<NodeId>,
}

/// Outcome of applying a new topology to the table.
#[derive(Debug, Default)]
pub struct Rebalance {
    /// Segments that are now transferring.
    pub started: Vec<SegmentId>,
    /// Segments that changed owners but need no transfer.
    pub settled: Vec<SegmentId>,
    /// Segments with pending owners and nobody left to pull from. These are
    /// also settled.
    pub lost: Vec<DataLossReport>,
}

impl Rebalance {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.settled.is_empty() && self.lost.is_empty()
    }
}

/// Result of recording a confirmation.
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// Last pending owner confirmed; the segment is stable.
    Completed(SegmentTransfer),
    /// Recorded, other owners are still pulling.
    Pending { remaining: usize },
    /// The confirmation is for a topology not applied yet.
    Buffered,
    /// Stale or duplicate confirmation.
    Ignored,
}

/// Per-node table of segment transfers.
#[derive(Debug, Default)]
pub struct TransferTable {
    applied: TopologyId,
    active: BTreeMap<SegmentId, SegmentTransfer>,
    /// Confirmations that arrived ahead of their topology.
    early: Vec<(TopologyId, SegmentId, NodeId)>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last topology passed to [`rebalance`](Self::rebalance).
    pub fn applied_topology(&self) -> TopologyId {
        self.applied
    }

    pub fn state(&self, segment: SegmentId) -> SegmentState {
        if self.active.contains_key(&segment) {
            SegmentState::Transferring
        } else {
            SegmentState::Stable
        }
    }

    pub fn is_transferring(&self, segment: SegmentId) -> bool {
        self.active.contains_key(&segment)
    }

    pub fn get(&self, segment: SegmentId) -> Option<&SegmentTransfer> {
        self.active.get(&segment)
    }

    pub fn active(&self) -> impl Iterator<Item = &SegmentTransfer> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn transferring_segments(&self) -> BTreeSet<SegmentId> {
        self.active.keys().copied().collect()
    }

    /// Transfers that `node` still has to pull.
    pub fn pending_for(&self, node: &NodeId) -> Vec<&SegmentTransfer> {
        self.active.values().filter(|t| t.is_pending(node)).collect()
    }

    /// Applies a topology change.
    ///
    /// Recomputes every segment whose owners differ between `old` and `new`
    /// plus every segment still transferring from an earlier change. Sources
    /// are the holders that remain members of `new`.
    pub fn rebalance(&mut self, old: &Topology, new: &Topology) -> Rebalance {
        let mut outcome = Rebalance::default();
        let mut candidates: BTreeSet<SegmentId> =
            ConsistentHashView::diff(old.view(), new.view()).into_keys().collect();
        candidates.extend(self.active.keys().copied());

        let bootstrap = old.is_empty();

        for segment in candidates {
            let new_owners = new.owners_of(segment).to_vec();
            let previous = self.active.remove(&segment);

            let (holders, previous_owners, started_in, keys, started_at) = match &previous {
                Some(t) => (
                    t.holders().copied().collect::<Vec<_>>(),
                    t.previous_owners.clone(),
                    t.started_in,
                    t.keys_transferred,
                    t.started_at,
                ),
                None => {
                    let owners = old.owners_of(segment).to_vec();
                    (owners.clone(), owners, new.id(), 0, Instant::now())
                }
            };

            let sources: Vec<NodeId> =
                holders.iter().filter(|n| new.contains(n)).copied().collect();
            let mut pending: BTreeSet<NodeId> = new_owners
                .iter()
                .filter(|n| !sources.contains(n))
                .copied()
                .collect();

            if pending.is_empty() {
                outcome.settled.push(segment);
                continue;
            }

            if sources.is_empty() {
                if !(bootstrap && previous.is_none()) {
                    outcome.lost.push(DataLossReport {
                        segment,
                        topology_id: new.id(),
                        lost_holders: holders,
                    });
                }
                outcome.settled.push(segment);
                continue;
            }

            let mut confirmed = Vec::new();
            for (_, _, node) in self
                .early
                .iter()
                .filter(|(id, seg, _)| *id == new.id() && *seg == segment)
            {
                if pending.remove(node) {
                    confirmed.push(*node);
                }
            }
            if pending.is_empty() {
                outcome.settled.push(segment);
                continue;
            }

            self.active.insert(
                segment,
                SegmentTransfer {
                    segment,
                    started_in,
                    topology_id: new.id(),
                    previous_owners,
                    sources,
                    new_owners,
                    pending,
                    confirmed,
                    keys_transferred: keys,
                    started_at,
                },
            );
            outcome.started.push(segment);
        }

        self.applied = new.id();
        self.early.retain(|(id, _, _)| *id > new.id());
        outcome
    }

    /// Records that `node` finished pulling `segment` under `topology_id`.
    ///
    /// A confirmation from an earlier topology is still accepted while the
    /// same transfer is running, since no writes reach a transferring
    /// segment.
    pub fn confirm(
        &mut self,
        topology_id: TopologyId,
        segment: SegmentId,
        node: NodeId,
    ) -> ConfirmOutcome {
        if topology_id > self.applied {
            if !self.early.contains(&(topology_id, segment, node)) {
                self.early.push((topology_id, segment, node));
            }
            return ConfirmOutcome::Buffered;
        }

        let Some(transfer) = self.active.get_mut(&segment) else {
            return ConfirmOutcome::Ignored;
        };
        if topology_id < transfer.started_in || !transfer.pending.remove(&node) {
            return ConfirmOutcome::Ignored;
        }
        transfer.confirmed.push(node);

        if transfer.pending.is_empty() {
            match self.active.remove(&segment) {
                Some(done) => ConfirmOutcome::Completed(done),
                None => ConfirmOutcome::Ignored,
            }
        } else {
            ConfirmOutcome::Pending {
                remaining: transfer.pending.len(),
            }
        }
    }

    /// Adds to the transferred key counter of an active transfer.
    pub fn record_transferred(&mut self, segment: SegmentId, count: u64) {
        if let Some(t) = self.active.get_mut(&segment) {
            t.keys_transferred += count;
        }
    }
}

/// A page of entries pulled from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBatch {
    pub segment: SegmentId,
    /// Entries in key order, tombstones included.
    pub entries: Vec<TransferEntry>,
    /// True when no entries follow this batch.
    pub done: bool,
}

impl TransferBatch {
    pub fn new(segment: SegmentId) -> Self {
        Self {
            segment,
            entries: Vec::new(),
            done: false,
        }
    }

    pub fn push(&mut self, key: Key, value: Option<Bytes>, version: Version) {
        self.entries.push(TransferEntry {
            key,
            value,
            version,
        });
    }

    /// Key to resume after, if any.
    pub fn last_key(&self) -> Option<&Key> {
        self.entries.last().map(|e| &e.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single transferred entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub key: Key,
    /// `None` for a tombstone.
    pub value: Option<Bytes>,
    pub version: Version,
}

/// Errors that can occur during state transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// No surviving node held the segment.
    #[error("segment {segment} lost all holders in topology {topology_id}")]
    DataLoss {
        segment: SegmentId,
        topology_id: TopologyId,
    },

    /// Every source failed to serve the pull.
    #[error("all {attempts} sources failed for segment {segment}")]
    SourcesExhausted { segment: SegmentId, attempts: usize },

    /// A source refused the pull.
    #[error("node {node} refused to serve segment {segment}")]
    Rejected { segment: SegmentId, node: NodeId },
}
