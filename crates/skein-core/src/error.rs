//! Error types for the transaction and RPC layers.

use skein_cluster::{Key, NodeId, SegmentId, TopologyId, Version};
use thiserror::Error;

use crate::message::TxId;

/// Failures of a single node-to-node call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The target is not registered on the network.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// No reply within the RPC timeout.
    #[error("call to node {0} timed out")]
    Timeout(NodeId),

    /// The target accepted the request but dropped the reply channel.
    #[error("node {0} closed the request without replying")]
    Closed(NodeId),
}

/// What the validating owner saw instead of the expected version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The entry was committed by someone else since it was read.
    VersionChanged { expected: Version, found: Version },
    /// Another transaction holds the key's lock.
    Locked { holder: TxId },
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionChanged { expected, found } => {
                write!(f, "read {expected}, owner has {found}")
            }
            Self::Locked { holder } => write!(f, "locked by {holder}"),
        }
    }
}

/// Why a transaction did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("write skew on key '{key}': {conflict}")]
    WriteSkew { key: Key, conflict: Conflict },

    /// Ownership of a touched segment moved after the transaction started.
    #[error("topology changed from {started} to {current} during the transaction")]
    TopologyChanged {
        started: TopologyId,
        current: TopologyId,
    },

    #[error("transaction timed out")]
    Timeout,

    /// No owner of the segment answered.
    #[error("segment {segment} is unavailable")]
    Unavailable { segment: SegmentId },

    /// The transaction was already committed or rolled back.
    #[error("transaction is no longer active")]
    NotActive,

    #[error("transaction was cancelled")]
    Cancelled,
}

/// Coarse abort classification reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    WriteSkew,
    TopologyChanged,
    Timeout,
    Unavailable,
}

impl TxError {
    /// Maps to the client-facing abort reason. Misuse errors have none.
    pub fn reason(&self) -> Option<AbortReason> {
        match self {
            Self::WriteSkew { .. } => Some(AbortReason::WriteSkew),
            Self::TopologyChanged { .. } => Some(AbortReason::TopologyChanged),
            Self::Timeout | Self::Cancelled => Some(AbortReason::Timeout),
            Self::Unavailable { .. } => Some(AbortReason::Unavailable),
            Self::NotActive => None,
        }
    }

    /// Returns true if re-running the transaction from scratch can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WriteSkew { .. }
                | Self::TopologyChanged { .. }
                | Self::Timeout
                | Self::Unavailable { .. }
        )
    }
}

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Topology(#[from] skein_cluster::TopologyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        let skew = TxError::WriteSkew {
            key: Key::from("k"),
            conflict: Conflict::VersionChanged {
                expected: Version(1),
                found: Version(2),
            },
        };
        assert!(skew.is_retryable());
        assert_eq!(skew.reason(), Some(AbortReason::WriteSkew));
        assert!(TxError::Timeout.is_retryable());
        assert!(!TxError::NotActive.is_retryable());
        assert!(!TxError::Cancelled.is_retryable());
        assert_eq!(TxError::NotActive.reason(), None);
    }

    #[test]
    fn error_messages() {
        let skew = TxError::WriteSkew {
            key: Key::from("acct"),
            conflict: Conflict::VersionChanged {
                expected: Version(3),
                found: Version(4),
            },
        };
        assert_eq!(skew.to_string(), "write skew on key 'acct': read v3, owner has v4");

        let moved = TxError::TopologyChanged {
            started: 2,
            current: 4,
        };
        assert_eq!(
            moved.to_string(),
            "topology changed from 2 to 4 during the transaction"
        );
    }
}
