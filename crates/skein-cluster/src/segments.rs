//! Segment ownership.
//!
//! Keys map to a fixed number of segments through the cluster's
//! [`HashFunction`]; segments map to an ordered replica set (primary first)
//! chosen by rendezvous hashing over the membership. Every node derives the
//! same view from the same member list, so only membership ever has to be
//! exchanged.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::hash::{segment_for_hash, HashFunction};
use crate::{Key, NodeId, TopologyError};

/// Logical partition of the key space.
pub type SegmentId = u32;

/// Segment count used when none is configured.
pub const DEFAULT_SEGMENT_COUNT: u32 = 256;

/// The fixed shape of a cluster's key space.
///
/// # Invariants
///
/// `num_segments >= 1` and `replication_factor >= 1`; enforced by
/// [`HashLayout::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashLayout {
    num_segments: u32,
    replication_factor: usize,
    hash: HashFunction,
}

impl HashLayout {
    pub fn new(
        num_segments: u32,
        replication_factor: usize,
        hash: HashFunction,
    ) -> Result<Self, TopologyError> {
        if num_segments == 0 {
            return Err(TopologyError::ZeroSegments);
        }
        if replication_factor == 0 {
            return Err(TopologyError::ZeroReplication);
        }
        Ok(Self {
            num_segments,
            replication_factor,
            hash,
        })
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash
    }

    /// Computes the segment for a key.
    pub fn segment_of(&self, key: &Key) -> SegmentId {
        segment_for_hash(self.hash.hash_bytes(key.as_bytes()), self.num_segments)
    }

    /// Iterates over every segment id.
    pub fn segments(&self) -> impl Iterator<Item = SegmentId> {
        0..self.num_segments
    }
}

/// Ownership change for one segment between two views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerDelta {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl OwnerDelta {
    /// True when only the order of owners changed (e.g. a new primary
    /// among the same replicas).
    pub fn is_reorder(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Immutable mapping from segment to its ordered owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHashView {
    layout: HashLayout,
    /// Sorted, deduplicated membership.
    members: Vec<NodeId>,
    owners: Vec<Vec<NodeId>>,
}

impl ConsistentHashView {
    /// A view with no members and no owners.
    pub fn empty(layout: HashLayout) -> Self {
        Self {
            layout,
            members: Vec::new(),
            owners: vec![Vec::new(); layout.num_segments as usize],
        }
    }

    /// Builds the view for a membership list.
    ///
    /// The input order does not matter. Each segment ranks all members by
    /// a per-(node, segment) weight and keeps the top
    /// `min(replication_factor, members)` as owners.
    pub fn build(layout: HashLayout, members: &[NodeId]) -> Result<Self, TopologyError> {
        let mut sorted = members.to_vec();
        sorted.sort();
        if let Some(dup) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(TopologyError::DuplicateMember(dup[0]));
        }

        let owner_count = layout.replication_factor.min(sorted.len());
        let owners = layout
            .segments()
            .map(|segment| {
                let mut ranked: Vec<(u32, NodeId)> = sorted
                    .iter()
                    .map(|node| (ownership_weight(layout.hash, node, segment), *node))
                    .collect();
                // heaviest first, ties broken by node id
                ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                ranked
                    .into_iter()
                    .take(owner_count)
                    .map(|(_, node)| node)
                    .collect()
            })
            .collect();

        Ok(Self {
            layout,
            members: sorted,
            owners,
        })
    }

    pub fn layout(&self) -> HashLayout {
        self.layout
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_segments(&self) -> u32 {
        self.layout.num_segments
    }

    /// Ordered owners of a segment, primary first. Empty for the empty view
    /// or an out-of-range segment.
    pub fn owners_of(&self, segment: SegmentId) -> &[NodeId] {
        self.owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary_of(&self, segment: SegmentId) -> Option<NodeId> {
        self.owners_of(segment).first().copied()
    }

    pub fn segment_of(&self, key: &Key) -> SegmentId {
        self.layout.segment_of(key)
    }

    pub fn owners_of_key(&self, key: &Key) -> &[NodeId] {
        self.owners_of(self.segment_of(key))
    }

    pub fn is_owner(&self, segment: SegmentId, node: &NodeId) -> bool {
        self.owners_of(segment).contains(node)
    }

    /// All segments a node owns, as primary or backup.
    pub fn segments_owned_by(&self, node: &NodeId) -> Vec<SegmentId> {
        self.layout
            .segments()
            .filter(|&s| self.is_owner(s, node))
            .collect()
    }

    /// Segments for which the node is primary.
    pub fn primary_segments(&self, node: &NodeId) -> Vec<SegmentId> {
        self.layout
            .segments()
            .filter(|&s| self.primary_of(s) == Some(*node))
            .collect()
    }

    /// Returns a count of owned segments per node.
    pub fn segment_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for owners in &self.owners {
            for node in owners {
                *counts.entry(*node).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Segments whose ordered owner list differs between `old` and `new`.
    ///
    /// Both views must share a layout; segments beyond the shorter view are
    /// compared against an empty owner list.
    pub fn diff(old: &ConsistentHashView, new: &ConsistentHashView) -> BTreeMap<SegmentId, OwnerDelta> {
        let count = old.num_segments().max(new.num_segments());
        let mut changes = BTreeMap::new();
        for segment in 0..count {
            let before = old.owners_of(segment);
            let after = new.owners_of(segment);
            if before == after {
                continue;
            }
            let delta = OwnerDelta {
                added: after.iter().filter(|n| !before.contains(n)).copied().collect(),
                removed: before.iter().filter(|n| !after.contains(n)).copied().collect(),
            };
            changes.insert(segment, delta);
        }
        changes
    }
}

/// Rendezvous weight of a node for a segment.
fn ownership_weight(hash: HashFunction, node: &NodeId, segment: SegmentId) -> u32 {
    let mut input = [0u8; 20];
    input[..16].copy_from_slice(node.as_bytes());
    input[16..].copy_from_slice(&segment.to_be_bytes());
    hash.hash_bytes(&input) as u32
}
