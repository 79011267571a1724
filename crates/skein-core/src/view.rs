//! A node's view of the cluster: the current topology, the transfer state of
//! every segment, and which segments this node actually holds.
//!
//! The topology and the transfer table change together under one write
//! lock, so a reader never sees a new topology paired with stale segment
//! states. Readers take cheap `Arc<Topology>` snapshots.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use skein_cluster::{
    ConfirmOutcome, HashLayout, NodeId, Rebalance, SegmentId, SegmentTransfer, Topology,
    TopologyId, TransferTable,
};
use tokio::sync::{watch, Notify};
use tracing::info;

/// Published whenever the topology or the transfer count changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStatus {
    pub topology_id: TopologyId,
    /// Segments still transferring.
    pub transferring: usize,
}

impl ViewStatus {
    pub fn is_stable(&self) -> bool {
        self.transferring == 0
    }
}

/// Result of installing a newer topology.
#[derive(Debug)]
pub struct Installed {
    pub previous: Arc<Topology>,
    pub current: Arc<Topology>,
    pub rebalance: Rebalance,
}

#[derive(Debug)]
struct ViewState {
    topology: Arc<Topology>,
    transfers: TransferTable,
}

#[derive(Debug)]
pub struct ClusterView {
    local: NodeId,
    state: RwLock<ViewState>,
    held: RwLock<BTreeSet<SegmentId>>,
    held_changed: Notify,
    status: watch::Sender<ViewStatus>,
}

impl ClusterView {
    pub fn new(local: NodeId, layout: HashLayout) -> Self {
        let (status, _) = watch::channel(ViewStatus {
            topology_id: 0,
            transferring: 0,
        });
        Self {
            local,
            state: RwLock::new(ViewState {
                topology: Arc::new(Topology::initial(layout)),
                transfers: TransferTable::new(),
            }),
            held: RwLock::new(BTreeSet::new()),
            held_changed: Notify::new(),
            status,
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn topology(&self) -> Arc<Topology> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.topology.clone()
    }

    pub fn topology_id(&self) -> TopologyId {
        self.status.borrow().topology_id
    }

    pub fn status(&self) -> ViewStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewStatus> {
        self.status.subscribe()
    }

    /// Swaps in `topology` if it is newer than the current one and
    /// rebalances the transfer table against it. Returns `None` for stale
    /// topologies.
    pub fn install(&self, topology: Topology) -> Option<Installed> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if topology.id() <= state.topology.id() {
            return None;
        }
        let previous = state.topology.clone();
        let current = Arc::new(topology);
        let rebalance = state.transfers.rebalance(&previous, &current);
        state.topology = current.clone();

        {
            let mut held = self.held.write().unwrap_or_else(|e| e.into_inner());
            let lost = rebalance.lost.iter().map(|l| l.segment);
            for segment in rebalance.settled.iter().copied().chain(lost) {
                if current.owners_of(segment).contains(&self.local) {
                    held.insert(segment);
                }
            }
            for segment in &rebalance.started {
                if let Some(t) = state.transfers.get(*segment) {
                    if t.is_pending(&self.local) {
                        held.remove(segment);
                    }
                }
            }
        }
        self.held_changed.notify_waiters();

        let transferring = state.transfers.active_count();
        drop(state);
        self.publish(current.id(), transferring);

        info!(
            topology_id = current.id(),
            members = current.members().len(),
            started = rebalance.started.len(),
            lost = rebalance.lost.len(),
            "installed topology"
        );
        Some(Installed {
            previous,
            current,
            rebalance,
        })
    }

    pub fn is_transferring(&self, segment: SegmentId) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.transfers.is_transferring(segment)
    }

    pub fn transfer(&self, segment: SegmentId) -> Option<SegmentTransfer> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.transfers.get(segment).cloned()
    }

    /// Transfers this node still has to pull.
    pub fn pending_pulls(&self) -> Vec<SegmentTransfer> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .transfers
            .pending_for(&self.local)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Current topology together with whether each of `segments` is
    /// transferring, read atomically.
    pub fn snapshot_for(&self, segments: &BTreeSet<SegmentId>) -> (Arc<Topology>, bool) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let transferring = segments
            .iter()
            .any(|s| state.transfers.is_transferring(*s));
        (state.topology.clone(), transferring)
    }

    /// Records a transfer confirmation. A completed transfer is not
    /// published until [`refresh`](Self::refresh), so the caller can finish
    /// its cleanup before waiters see the segment as stable.
    pub fn confirm(
        &self,
        topology_id: TopologyId,
        segment: SegmentId,
        node: NodeId,
    ) -> ConfirmOutcome {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.transfers.confirm(topology_id, segment, node)
    }

    /// Publishes the current topology id and transfer count.
    pub fn refresh(&self) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let (id, transferring) = (state.topology.id(), state.transfers.active_count());
        drop(state);
        self.publish(id, transferring);
    }

    pub fn record_transferred(&self, segment: SegmentId, count: u64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.transfers.record_transferred(segment, count);
    }

    pub fn holds(&self, segment: SegmentId) -> bool {
        let held = self.held.read().unwrap_or_else(|e| e.into_inner());
        held.contains(&segment)
    }

    pub fn held_segments(&self) -> BTreeSet<SegmentId> {
        let held = self.held.read().unwrap_or_else(|e| e.into_inner());
        held.clone()
    }

    pub fn mark_held(&self, segment: SegmentId) {
        {
            let mut held = self.held.write().unwrap_or_else(|e| e.into_inner());
            held.insert(segment);
        }
        self.held_changed.notify_waiters();
    }

    pub fn release_held(&self, segment: SegmentId) {
        let mut held = self.held.write().unwrap_or_else(|e| e.into_inner());
        held.remove(&segment);
    }

    /// Waits until this node holds `segment`. Returns false on timeout.
    pub async fn wait_until_held(&self, segment: SegmentId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.held_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.holds(segment) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.holds(segment);
            }
        }
    }

    /// Waits until a topology with id at least `id` is installed. Returns
    /// false on timeout.
    pub async fn wait_for_topology(&self, id: TopologyId, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| s.topology_id >= id)).await;
        matches!(reached, Ok(Ok(_)))
    }

    fn publish(&self, topology_id: TopologyId, transferring: usize) {
        self.status.send_replace(ViewStatus {
            topology_id,
            transferring,
        });
    }
}
