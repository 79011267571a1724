//! Error types for topology construction.

use crate::{NodeId, TopologyId};

/// Errors raised while building a hash layout or topology.
///
/// Lookups against an already built view never fail; only construction
/// validates its inputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A cluster needs at least one segment.
    #[error("segment count must be at least 1")]
    ZeroSegments,

    /// Every segment needs at least one owner.
    #[error("replication factor must be at least 1")]
    ZeroReplication,

    /// A topology with no members cannot own anything.
    #[error("membership for topology {0} is empty")]
    EmptyMembership(TopologyId),

    /// The same node was listed twice.
    #[error("node {0} appears more than once in the membership")]
    DuplicateMember(NodeId),
}
