//! skein-core: the replicated, transactional store.
//!
//! Each node keeps a versioned copy of the segments it owns. Transactions
//! buffer writes on the node that started them and commit with a two-phase
//! protocol: primaries validate the versions the transaction read and
//! assign new ones, backups apply those same versions. When membership
//! changes, new owners pull their segments from the surviving holders
//! before serving them.

pub mod cluster;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod locks;
pub mod message;
pub mod node;
pub mod participant;
pub mod rpc;
pub mod state_transfer;
pub mod store;
pub mod view;

pub use cluster::{LocalCluster, MembershipService};
pub use config::{ClusterConfig, IsolationLevel};
pub use context::{Observed, TransactionContext, TxStatus};
pub use coordinator::{CommitReceipt, TransactionCoordinator};
pub use error::{AbortReason, ConfigError, Conflict, RpcError, TxError};
pub use message::{PrepareRequest, PrepareRole, Rejection, Request, Response, TxId, WriteOp};
pub use node::Node;
pub use participant::Participant;
pub use rpc::{LocalNetwork, Transport};
pub use state_transfer::StateTransferManager;
pub use store::{CasOutcome, VersionedEntryStore, VersionedValue};
pub use view::{ClusterView, ViewStatus};
