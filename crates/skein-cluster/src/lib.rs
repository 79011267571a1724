//! skein-cluster: key placement for skein.
//!
//! Everything in this crate is pure and deterministic: given the same
//! configuration and the same membership list, every node computes the same
//! segment for a key and the same owners for a segment.
//!
//! - **Hashing**: MurmurHash2 in its fixed and legacy forms
//! - **Segments**: rendezvous ownership over a fixed number of segments
//! - **Topology**: immutable, numbered snapshots of membership and ownership
//! - **Transfer**: bookkeeping for segments moving between owners
//!
//! ```rust,ignore
//! use skein_cluster::{HashFunction, HashLayout, Key, NodeId, Topology};
//!
//! let layout = HashLayout::new(256, 2, HashFunction::Murmur2)?;
//! let members = vec![NodeId::new(), NodeId::new(), NodeId::new()];
//! let topology = Topology::from_membership(1, layout, &members)?;
//!
//! let segment = topology.segment_of(&Key::from("user:42"));
//! let primary = topology.primary_of(segment);
//! ```

mod error;
mod hash;
mod key;
mod segments;
mod topology;
mod transfer;

pub use error::TopologyError;
pub use hash::{murmur2, murmur2_compat, segment_for_hash, HashFunction, HashInput};
pub use key::{Key, Version};
pub use segments::{ConsistentHashView, HashLayout, OwnerDelta, SegmentId, DEFAULT_SEGMENT_COUNT};
pub use topology::{MembershipEvent, NodeId, Topology, TopologyId};
pub use transfer::{
    ConfirmOutcome, DataLossReport, Rebalance, SegmentState, SegmentTransfer, TransferBatch,
    TransferEntry, TransferError, TransferTable,
};
