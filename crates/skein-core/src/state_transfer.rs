//! Applying membership changes and moving segments between owners.
//!
//! A single task consumes the membership feed. For each newer topology it
//! installs the view, reports segments that lost every holder, pulls the
//! segments this node newly owns, and broadcasts a confirmation per pulled
//! segment. The next event is only taken once the pulls have finished or
//! been given up on.
//!
//! A pull that fails is retried with backoff for as long as its topology is
//! the newest one announced. A source that is alive but slow never turns
//! into a data loss; losses are only reported when a rebalance finds no
//! surviving holder.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use skein_cluster::{
    ConfirmOutcome, DataLossReport, Key, MembershipEvent, NodeId, SegmentId, SegmentTransfer,
    Topology, TopologyId, TransferError,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::RpcError;
use crate::message::{Rejection, Request, Response};
use crate::rpc::{call_with_timeout, Transport};
use crate::store::VersionedEntryStore;
use crate::view::ClusterView;

const PULL_RETRY_MIN: Duration = Duration::from_millis(20);
const PULL_RETRY_MAX: Duration = Duration::from_millis(500);

pub struct StateTransferManager {
    local: NodeId,
    config: Arc<ClusterConfig>,
    view: Arc<ClusterView>,
    store: Arc<VersionedEntryStore>,
    transport: Arc<dyn Transport>,
    /// Newest topology id seen on the membership feed, applied or not.
    announced: AtomicU64,
    reports: Mutex<Vec<DataLossReport>>,
    loss_tx: broadcast::Sender<DataLossReport>,
}

impl std::fmt::Debug for StateTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransferManager")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl StateTransferManager {
    pub fn new(
        config: Arc<ClusterConfig>,
        view: Arc<ClusterView>,
        store: Arc<VersionedEntryStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (loss_tx, _) = broadcast::channel(64);
        Self {
            local: view.local(),
            config,
            view,
            store,
            transport,
            announced: AtomicU64::new(0),
            reports: Mutex::new(Vec::new()),
            loss_tx,
        }
    }

    /// Starts the task that applies membership events in order.
    ///
    /// Events are read off the feed as soon as they arrive, so pulls still
    /// running for an older topology learn that they are stale.
    pub fn spawn(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<MembershipEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let (queue_tx, mut queue) = mpsc::unbounded_channel();
            let receive = async {
                while let Some(event) = events.recv().await {
                    manager.announce(event.topology_id);
                    if queue_tx.send(event).is_err() {
                        break;
                    }
                }
                drop(queue_tx);
            };
            let apply = async {
                while let Some(event) = queue.recv().await {
                    manager.apply(event).await;
                }
            };
            tokio::join!(receive, apply);
            debug!(node = %manager.local, "membership feed closed");
        })
    }

    fn announce(&self, topology_id: TopologyId) {
        self.announced.fetch_max(topology_id, Ordering::AcqRel);
    }

    /// True once a topology newer than `topology_id` has been announced.
    fn is_superseded(&self, topology_id: TopologyId) -> bool {
        self.announced.load(Ordering::Acquire) > topology_id
    }

    /// Every data loss seen by this node so far.
    pub fn data_loss_reports(&self) -> Vec<DataLossReport> {
        let reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.clone()
    }

    pub fn subscribe_data_loss(&self) -> broadcast::Receiver<DataLossReport> {
        self.loss_tx.subscribe()
    }

    /// Applies one membership event. Events that are not newer than the
    /// installed topology are ignored.
    pub async fn apply(&self, event: MembershipEvent) {
        self.announce(event.topology_id);
        let current_id = self.view.topology_id();
        if event.topology_id <= current_id {
            debug!(
                node = %self.local,
                topology_id = event.topology_id,
                current = current_id,
                "ignoring stale membership event"
            );
            return;
        }

        let layout = self.view.topology().layout();
        let topology = match Topology::from_membership(event.topology_id, layout, &event.members) {
            Ok(t) => t,
            Err(e) => {
                warn!(topology_id = event.topology_id, "rejected membership event: {e}");
                return;
            }
        };
        let Some(installed) = self.view.install(topology) else {
            return;
        };

        for report in &installed.rebalance.lost {
            self.report_loss(report.clone());
        }
        let settled = installed
            .rebalance
            .settled
            .iter()
            .copied()
            .chain(installed.rebalance.lost.iter().map(|l| l.segment));
        for segment in settled {
            self.drop_if_unowned(segment, &installed.current);
        }

        let pulls = self.view.pending_pulls();
        if pulls.is_empty() {
            return;
        }
        info!(
            node = %self.local,
            topology_id = installed.current.id(),
            segments = pulls.len(),
            "pulling segments"
        );

        let mut notify: BTreeSet<NodeId> = installed.previous.members().iter().copied().collect();
        notify.extend(installed.current.members().iter().copied());

        let mut running: FuturesUnordered<_> = pulls
            .into_iter()
            .map(|t| self.pull_and_confirm(t, installed.current.id(), &notify))
            .collect();
        while running.next().await.is_some() {}
    }

    async fn pull_and_confirm(
        &self,
        transfer: SegmentTransfer,
        topology_id: TopologyId,
        notify: &BTreeSet<NodeId>,
    ) {
        let segment = transfer.segment;
        let mut retry = PULL_RETRY_MIN;
        let mut attempt = 0u32;
        let count = loop {
            if self.is_superseded(topology_id) {
                // the next rebalance recomputes sources and pulls again
                info!(node = %self.local, segment, topology_id, "pull abandoned for a newer topology");
                return;
            }
            match self.pull(&transfer, topology_id).await {
                Ok(count) => break count,
                Err(e) => {
                    attempt += 1;
                    warn!(
                        node = %self.local,
                        segment,
                        topology_id,
                        attempt,
                        retry_in = ?retry,
                        "state transfer failed, retrying: {e}"
                    );
                    tokio::time::sleep(retry).await;
                    retry = (retry * 2).min(PULL_RETRY_MAX);
                }
            }
        };

        self.view.record_transferred(segment, count);
        debug!(node = %self.local, segment, keys = count, attempts = attempt + 1, "segment pulled");
        self.view.mark_held(segment);
        self.broadcast_confirm(segment, topology_id, notify).await;
    }

    /// Pulls a whole segment, trying each source in order.
    async fn pull(
        &self,
        transfer: &SegmentTransfer,
        topology_id: TopologyId,
    ) -> Result<u64, TransferError> {
        let segment = transfer.segment;
        for source in &transfer.sources {
            match self.pull_from(*source, segment, topology_id).await {
                Ok(count) => return Ok(count),
                Err(e) => warn!(
                    node = %self.local,
                    segment,
                    source = %source,
                    "pull failed, trying next source: {e}"
                ),
            }
        }
        Err(TransferError::SourcesExhausted {
            segment,
            attempts: transfer.sources.len(),
        })
    }

    async fn pull_from(
        &self,
        source: NodeId,
        segment: SegmentId,
        topology_id: TopologyId,
    ) -> Result<u64, PullError> {
        let mut after: Option<Key> = None;
        let mut count = 0u64;
        loop {
            let request = Request::TransferPull {
                segment,
                topology_id,
                after: after.clone(),
                limit: self.config.transfer_batch_size,
            };
            let response = call_with_timeout(
                &*self.transport,
                self.local,
                source,
                request,
                self.config.transfer_timeout(),
            )
            .await?;

            let batch = match response {
                Response::Batch(batch) => batch,
                Response::NotHolder => {
                    return Err(TransferError::Rejected {
                        segment,
                        node: source,
                    }
                    .into())
                }
                Response::Rejected(r) => return Err(PullError::Refused(r)),
                other => return Err(PullError::Unexpected(format!("{other:?}"))),
            };

            let done = batch.done;
            if let Some(last) = batch.last_key() {
                after = Some(last.clone());
            }
            for entry in batch.entries {
                self.store.apply_versioned(entry.key, entry.value, entry.version);
                count += 1;
            }
            if done {
                return Ok(count);
            }
        }
    }

    async fn broadcast_confirm(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        notify: &BTreeSet<NodeId>,
    ) {
        self.on_confirm(segment, topology_id, self.local);

        let timeout = self.config.rpc_timeout();
        let mut sends: FuturesUnordered<_> = notify
            .iter()
            .filter(|n| **n != self.local)
            .map(|node| {
                let request = Request::TransferConfirm {
                    segment,
                    topology_id,
                    node: self.local,
                };
                call_with_timeout(&*self.transport, self.local, *node, request, timeout)
            })
            .collect();
        while let Some(result) = sends.next().await {
            if let Err(e) = result {
                debug!(segment, "confirm not delivered: {e}");
            }
        }
    }

    /// Records a confirmation from `node`, dropping the local copy once the
    /// transfer completes if this node no longer owns the segment.
    pub fn on_confirm(&self, segment: SegmentId, topology_id: TopologyId, node: NodeId) -> Response {
        match self.view.confirm(topology_id, segment, node) {
            ConfirmOutcome::Completed(transfer) => {
                info!(
                    node = %self.local,
                    segment,
                    topology_id = transfer.topology_id,
                    keys = transfer.keys_transferred,
                    elapsed = ?transfer.started_at.elapsed(),
                    "segment transfer complete"
                );
                self.drop_if_unowned(segment, &self.view.topology());
                self.view.refresh();
            }
            ConfirmOutcome::Pending { remaining } => {
                debug!(segment, confirmed_by = %node, remaining, "transfer confirmation");
            }
            ConfirmOutcome::Buffered => {
                debug!(segment, topology_id, "buffered early confirmation");
            }
            ConfirmOutcome::Ignored => {}
        }
        Response::Ack
    }

    fn drop_if_unowned(&self, segment: SegmentId, topology: &Topology) {
        if topology.owners_of(segment).contains(&self.local) || !self.view.holds(segment) {
            return;
        }
        self.view.release_held(segment);
        let removed = self.store.drop_segment(segment);
        debug!(node = %self.local, segment, removed, "dropped segment copy");
    }

    fn report_loss(&self, report: DataLossReport) {
        error!(
            node = %self.local,
            segment = report.segment,
            topology_id = report.topology_id,
            "data loss: no surviving holder for segment"
        );
        {
            let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
            reports.push(report.clone());
        }
        // nobody listening is fine
        let _ = self.loss_tx.send(report);
    }
}

/// Why a single source could not serve a pull.
#[derive(Debug, thiserror::Error)]
enum PullError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("source refused: {0}")]
    Refused(Rejection),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}
