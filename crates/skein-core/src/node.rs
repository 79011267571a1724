//! A cluster node: the store, its view of the cluster, the replica-side
//! participant, the local coordinator and the state transfer task, wired
//! to one request channel.
//!
//! Each incoming request runs on its own task, so a read blocked on a
//! segment that is still arriving never stalls the commits and transfer
//! pulls behind it.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use skein_cluster::{Key, MembershipEvent, NodeId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::context::TransactionContext;
use crate::coordinator::{CommitReceipt, TransactionCoordinator};
use crate::error::{ConfigError, TxError};
use crate::message::{Request, Response, TxId};
use crate::participant::Participant;
use crate::rpc::{self, Envelope, LocalNetwork};
use crate::state_transfer::StateTransferManager;
use crate::store::VersionedEntryStore;
use crate::view::{ClusterView, ViewStatus};

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    config: Arc<ClusterConfig>,
    network: LocalNetwork,
    view: Arc<ClusterView>,
    participant: Arc<Participant>,
    coordinator: TransactionCoordinator,
    transfers: Arc<StateTransferManager>,
    membership: mpsc::UnboundedSender<MembershipEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Starts a node with a fresh id and registers it on `network`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClusterConfig, network: LocalNetwork) -> Result<Arc<Self>, ConfigError> {
        Self::start_with_id(NodeId::new(), config, network)
    }

    pub fn start_with_id(
        id: NodeId,
        config: ClusterConfig,
        network: LocalNetwork,
    ) -> Result<Arc<Self>, ConfigError> {
        let layout = config.validate()?;
        let config = Arc::new(config);
        let transport: Arc<dyn rpc::Transport> = Arc::new(network.clone());

        let store = Arc::new(VersionedEntryStore::new(layout));
        let view = Arc::new(ClusterView::new(id, layout));
        let participant = Arc::new(Participant::new(config.clone(), store.clone(), view.clone()));
        let coordinator = TransactionCoordinator::new(config.clone(), view.clone(), transport.clone());
        let transfers = Arc::new(StateTransferManager::new(
            config.clone(),
            view.clone(),
            store,
            transport,
        ));

        let (membership, events) = mpsc::unbounded_channel();
        let (handle, requests) = rpc::channel(id, config.request_buffer);
        network.register(handle);

        let tasks = vec![
            transfers.spawn(events),
            tokio::spawn(serve(
                id,
                requests,
                participant.clone(),
                transfers.clone(),
                config.clone(),
            )),
        ];
        info!(node = %id, "node started");

        Ok(Arc::new(Self {
            id,
            config,
            network,
            view,
            participant,
            coordinator,
            transfers,
            membership,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn status(&self) -> ViewStatus {
        self.view.status()
    }

    pub fn store(&self) -> &Arc<VersionedEntryStore> {
        self.participant.store()
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn transfers(&self) -> &StateTransferManager {
        &self.transfers
    }

    /// Hands a membership event to the state transfer task. Returns false
    /// once the node has stopped.
    pub fn deliver(&self, event: MembershipEvent) -> bool {
        self.membership.send(event).is_ok()
    }

    /// Sender for this node's membership feed.
    pub fn membership_feed(&self) -> mpsc::UnboundedSender<MembershipEvent> {
        self.membership.clone()
    }

    /// Stops the node abruptly: peers see it as unreachable and in-flight
    /// work on it is abandoned.
    pub fn stop(&self) {
        self.network.deregister(&self.id);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        info!(node = %self.id, "node stopped");
    }

    pub fn is_running(&self) -> bool {
        self.network.contains(&self.id)
    }

    // -- transactions --

    pub fn begin(&self) -> TransactionContext {
        self.coordinator.begin()
    }

    pub async fn get(&self, ctx: &mut TransactionContext, key: &Key) -> Result<Option<Bytes>, TxError> {
        self.coordinator.get(ctx, key).await
    }

    pub fn put(&self, ctx: &mut TransactionContext, key: Key, value: Bytes) -> Result<(), TxError> {
        self.coordinator.put(ctx, key, value)
    }

    pub fn remove(&self, ctx: &mut TransactionContext, key: Key) -> Result<(), TxError> {
        self.coordinator.remove(ctx, key)
    }

    pub async fn commit(&self, ctx: TransactionContext) -> Result<CommitReceipt, TxError> {
        self.coordinator.commit(ctx).await
    }

    pub fn rollback(&self, ctx: TransactionContext) -> Result<(), TxError> {
        self.coordinator.rollback(ctx)
    }

    pub fn cancel(&self, tx: TxId) -> bool {
        self.coordinator.cancel(tx)
    }

    // -- single-key conveniences, each its own transaction --

    pub async fn read(&self, key: &Key) -> Result<Option<Bytes>, TxError> {
        let mut ctx = self.begin();
        let value = self.get(&mut ctx, key).await?;
        self.commit(ctx).await?;
        Ok(value)
    }

    pub async fn write(&self, key: Key, value: Bytes) -> Result<CommitReceipt, TxError> {
        let mut ctx = self.begin();
        self.put(&mut ctx, key, value)?;
        self.commit(ctx).await
    }

    pub async fn delete(&self, key: Key) -> Result<CommitReceipt, TxError> {
        let mut ctx = self.begin();
        self.remove(&mut ctx, key)?;
        self.commit(ctx).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// The node's request loop. Also runs the lock reaper on a fixed tick.
async fn serve(
    id: NodeId,
    mut requests: mpsc::Receiver<Envelope>,
    participant: Arc<Participant>,
    transfers: Arc<StateTransferManager>,
    config: Arc<ClusterConfig>,
) {
    let mut reaper_tick = tokio::time::interval(config.reaper_interval());
    reaper_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            envelope = requests.recv() => {
                let Some(envelope) = envelope else { break };
                let participant = participant.clone();
                let transfers = transfers.clone();
                tokio::spawn(async move {
                    let Envelope { from, request, reply } = envelope;
                    let kind = request.kind();
                    let response = handle(request, &participant, &transfers).await;
                    if reply.send(response).is_err() {
                        debug!(node = %id, %from, kind, "caller went away before the reply");
                    }
                });
            }
            _ = reaper_tick.tick() => {
                participant.reap_expired();
            }
        }
    }
    debug!(node = %id, "request channel closed");
}

async fn handle(
    request: Request,
    participant: &Participant,
    transfers: &StateTransferManager,
) -> Response {
    match request {
        Request::Read {
            segment,
            key,
            topology_id,
        } => participant.read(segment, key, topology_id).await,
        Request::Prepare(req) => participant.prepare(req),
        Request::Commit { tx, segments } => participant.commit(tx, &segments),
        Request::Rollback { tx } => participant.rollback(tx),
        Request::TransferPull {
            segment,
            topology_id,
            after,
            limit,
        } => {
            participant
                .transfer_pull(segment, topology_id, after, limit)
                .await
        }
        Request::TransferConfirm {
            segment,
            topology_id,
            node,
        } => transfers.on_confirm(segment, topology_id, node),
    }
}
