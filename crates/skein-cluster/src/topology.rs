//! Cluster topology snapshots.
//!
//! A topology pairs a monotonically increasing id with the ownership view
//! derived from one membership list. Snapshots are immutable: a membership
//! change produces a brand new `Topology`, which nodes swap in atomically.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::segments::{ConsistentHashView, HashLayout, SegmentId};
use crate::{Key, TopologyError};

/// Monotonically increasing topology identifier. `0` is the empty,
/// pre-membership topology.
pub type TopologyId = u64;

/// Unique identifier for a cluster node.
///
/// Wraps a UUID v4 for guaranteed uniqueness across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Raw bytes of the id, used as hash input for ownership weights.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability (similar to git short hashes)
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A membership change delivered by the group-membership service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub topology_id: TopologyId,
    pub members: Vec<NodeId>,
}

impl MembershipEvent {
    pub fn new(topology_id: TopologyId, members: Vec<NodeId>) -> Self {
        Self {
            topology_id,
            members,
        }
    }
}

/// An immutable, versioned snapshot of membership and segment ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    id: TopologyId,
    view: ConsistentHashView,
}

impl Topology {
    /// The empty topology a node starts from before its first event.
    pub fn initial(layout: HashLayout) -> Self {
        Self {
            id: 0,
            view: ConsistentHashView::empty(layout),
        }
    }

    /// Builds the topology for a membership event.
    pub fn from_membership(
        id: TopologyId,
        layout: HashLayout,
        members: &[NodeId],
    ) -> Result<Self, TopologyError> {
        if members.is_empty() {
            return Err(TopologyError::EmptyMembership(id));
        }
        Ok(Self {
            id,
            view: ConsistentHashView::build(layout, members)?,
        })
    }

    pub fn id(&self) -> TopologyId {
        self.id
    }

    pub fn view(&self) -> &ConsistentHashView {
        &self.view
    }

    pub fn layout(&self) -> HashLayout {
        self.view.layout()
    }

    pub fn members(&self) -> &[NodeId] {
        self.view.members()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.view.members().contains(node)
    }

    pub fn is_empty(&self) -> bool {
        self.view.members().is_empty()
    }

    pub fn segment_of(&self, key: &Key) -> SegmentId {
        self.view.segment_of(key)
    }

    pub fn owners_of(&self, segment: SegmentId) -> &[NodeId] {
        self.view.owners_of(segment)
    }

    pub fn primary_of(&self, segment: SegmentId) -> Option<NodeId> {
        self.view.primary_of(segment)
    }

    /// Returns true if `segment` has a different ordered owner list in
    /// `other`. Identical ids short-circuit to false.
    pub fn reassigns(&self, other: &Topology, segment: SegmentId) -> bool {
        self.id != other.id && self.owners_of(segment) != other.owners_of(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashFunction;

    fn layout() -> HashLayout {
        HashLayout::new(32, 2, HashFunction::Murmur2).unwrap()
    }

    #[test]
    fn node_id_display() {
        let id = NodeId::new();
        let display = id.to_string();
        assert_eq!(display.len(), 8);
    }

    #[test]
    fn node_id_parse() {
        let id = NodeId::new();
        let parsed = NodeId::parse(&id.0.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn initial_topology_is_empty() {
        let t = Topology::initial(layout());
        assert_eq!(t.id(), 0);
        assert!(t.is_empty());
        assert!(t.owners_of(0).is_empty());
        assert_eq!(t.primary_of(0), None);
    }

    #[test]
    fn empty_membership_rejected() {
        assert_eq!(
            Topology::from_membership(3, layout(), &[]),
            Err(TopologyError::EmptyMembership(3))
        );
    }

    #[test]
    fn same_membership_same_topology() {
        let members: Vec<NodeId> = (0..4).map(|_| NodeId::new()).collect();
        let a = Topology::from_membership(5, layout(), &members).unwrap();
        let mut shuffled = members.clone();
        shuffled.reverse();
        let b = Topology::from_membership(5, layout(), &shuffled).unwrap();
        for seg in 0..32 {
            assert_eq!(a.owners_of(seg), b.owners_of(seg));
        }
    }

    #[test]
    fn reassigns_tracks_owner_changes() {
        let members: Vec<NodeId> = (0..4).map(|_| NodeId::new()).collect();
        let before = Topology::from_membership(1, layout(), &members).unwrap();
        let after = Topology::from_membership(2, layout(), &members[..3]).unwrap();
        let gone = members[3];

        for seg in 0..32 {
            let owned_by_gone = before.owners_of(seg).contains(&gone);
            assert_eq!(before.reassigns(&after, seg), owned_by_gone);
            assert!(!before.reassigns(&before, seg));
        }
    }
}
