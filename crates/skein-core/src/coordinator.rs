//! Client-side transaction coordination.
//!
//! Reads go to the current owner of a key and are recorded in the
//! transaction's read-set. Writes are buffered. `commit` runs a two-phase
//! commit across every segment the write-set touches:
//!
//! 1. topology gate: abort if ownership of any touched segment moved
//! 2. prepare on each primary, which validates versions and assigns new ones
//! 3. prepare on each backup with the primary's versions pinned
//! 4. commit on the primaries, then on the backups of every segment whose
//!    primary applied it; roll back everywhere on the first prepare failure
//!
//! Once the first commit message is sent the transaction can no longer be
//! cancelled. A primary that already released the prepare (its lock
//! expired) refuses the commit, and the transaction ends as `Timeout`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use skein_cluster::{Key, NodeId, SegmentId, Topology, Version};
use tracing::{debug, warn};

use crate::config::{ClusterConfig, IsolationLevel};
use crate::context::{TransactionContext, TxStatus};
use crate::error::{Conflict, RpcError, TxError};
use crate::message::{PrepareRequest, PrepareRole, Rejection, Request, Response, TxId, WriteOp};
use crate::rpc::{call_with_timeout, Transport};
use crate::view::ClusterView;

/// A committed transaction and the versions its writes received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx: TxId,
    pub versions: BTreeMap<Key, Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentPhase {
    Preparing,
    Committing,
}

/// In-memory record of a commit in progress.
#[derive(Debug)]
struct Intent {
    phase: IntentPhase,
    cancelled: bool,
    started_at: Instant,
}

type CallResult = (NodeId, SegmentId, Result<Response, RpcError>);

pub struct TransactionCoordinator {
    local: NodeId,
    config: Arc<ClusterConfig>,
    view: Arc<ClusterView>,
    transport: Arc<dyn Transport>,
    next_seq: AtomicU64,
    intents: DashMap<TxId, Intent>,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("local", &self.local)
            .field("in_flight", &self.intents.len())
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    pub fn new(
        config: Arc<ClusterConfig>,
        view: Arc<ClusterView>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local: view.local(),
            config,
            view,
            transport,
            next_seq: AtomicU64::new(1),
            intents: DashMap::new(),
        }
    }

    /// Starts a transaction against the current topology.
    pub fn begin(&self) -> TransactionContext {
        let id = TxId {
            origin: self.local,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        TransactionContext::new(id, self.view.topology())
    }

    /// Commits currently in flight.
    pub fn in_flight(&self) -> usize {
        self.intents.len()
    }

    /// Reads `key` inside the transaction.
    pub async fn get(
        &self,
        ctx: &mut TransactionContext,
        key: &Key,
    ) -> Result<Option<Bytes>, TxError> {
        if !ctx.is_active() {
            return Err(TxError::NotActive);
        }
        if let Some(pending) = ctx.pending_write(key) {
            return Ok(pending.clone());
        }
        if self.config.isolation == IsolationLevel::RepeatableRead {
            if let Some(observed) = ctx.observed(key) {
                return Ok(observed.value.clone());
            }
        }

        let (value, version) = self.fetch(key).await?;
        ctx.observe(key.clone(), value.clone(), version);
        Ok(value)
    }

    /// Reads from the primary, falling back through the backups.
    async fn fetch(&self, key: &Key) -> Result<(Option<Bytes>, Version), TxError> {
        let topology = self.view.topology();
        let segment = topology.segment_of(key);
        let mut last = TxError::Unavailable { segment };

        for owner in topology.owners_of(segment) {
            let request = Request::Read {
                segment,
                key: key.clone(),
                topology_id: topology.id(),
            };
            let result = call_with_timeout(
                &*self.transport,
                self.local,
                *owner,
                request,
                self.config.rpc_timeout(),
            )
            .await;
            match result {
                Ok(Response::Value { value, version }) => return Ok((value, version)),
                Ok(other) => {
                    debug!(%key, segment, owner = %owner, ?other, "read refused, trying next owner");
                }
                Err(RpcError::Timeout(node)) => {
                    debug!(%key, segment, owner = %node, "read timed out");
                    last = TxError::Timeout;
                }
                Err(e) => debug!(%key, segment, "read failed: {e}"),
            }
        }
        Err(last)
    }

    pub fn put(
        &self,
        ctx: &mut TransactionContext,
        key: Key,
        value: Bytes,
    ) -> Result<(), TxError> {
        if !ctx.is_active() {
            return Err(TxError::NotActive);
        }
        ctx.buffer_write(key, Some(value));
        Ok(())
    }

    pub fn remove(&self, ctx: &mut TransactionContext, key: Key) -> Result<(), TxError> {
        if !ctx.is_active() {
            return Err(TxError::NotActive);
        }
        ctx.buffer_write(key, None);
        Ok(())
    }

    /// Abandons a transaction that has not started committing.
    pub fn rollback(&self, mut ctx: TransactionContext) -> Result<(), TxError> {
        if !ctx.is_active() {
            return Err(TxError::NotActive);
        }
        ctx.set_status(TxStatus::RolledBack);
        debug!(tx = %ctx.id(), "rolled back before commit");
        Ok(())
    }

    /// Requests that an in-flight commit roll back. Only effective before
    /// the commit phase begins; returns whether the request was accepted.
    pub fn cancel(&self, tx: TxId) -> bool {
        match self.intents.get_mut(&tx) {
            Some(mut intent) if intent.phase == IntentPhase::Preparing => {
                intent.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Moves `tx` into the commit phase unless it was cancelled. The flag
    /// is read and the phase switched under the same entry lock `cancel`
    /// takes.
    fn begin_commit_phase(&self, tx: &TxId) -> bool {
        match self.intents.get_mut(tx) {
            Some(mut intent) if !intent.cancelled => {
                intent.phase = IntentPhase::Committing;
                true
            }
            _ => false,
        }
    }

    pub async fn commit(&self, mut ctx: TransactionContext) -> Result<CommitReceipt, TxError> {
        if !ctx.is_active() {
            return Err(TxError::NotActive);
        }
        let tx = ctx.id();
        if ctx.is_read_only() {
            ctx.set_status(TxStatus::Committed);
            return Ok(CommitReceipt {
                tx,
                versions: BTreeMap::new(),
            });
        }

        let segments = ctx.touched_segments();
        let current = self.gate(&ctx, &segments)?;

        ctx.set_status(TxStatus::Preparing);
        self.intents.insert(
            tx,
            Intent {
                phase: IntentPhase::Preparing,
                cancelled: false,
                started_at: Instant::now(),
            },
        );

        let mut contacted: BTreeSet<NodeId> = BTreeSet::new();
        let prepared = self.prepare_all(&ctx, &current, &mut contacted).await;

        let prepared = match prepared {
            Ok(versions) if self.begin_commit_phase(&tx) => versions,
            outcome => {
                let err = outcome.err().unwrap_or(TxError::Cancelled);
                self.rollback_participants(tx, &contacted).await;
                ctx.set_status(TxStatus::RolledBack);
                self.intents.remove(&tx);
                debug!(%tx, "aborted: {err}");
                return Err(err);
            }
        };
        ctx.set_status(TxStatus::Prepared);

        let written = ctx.written_segments();
        let mut primaries: BTreeMap<NodeId, Vec<SegmentId>> = BTreeMap::new();
        for segment in &written {
            if let Some(primary) = current.primary_of(*segment) {
                primaries.entry(primary).or_default().push(*segment);
            }
        }
        let timeout = self.config.rpc_timeout();
        let retries = self.config.commit_retries;

        let delivery = send_commits(
            self.transport.clone(),
            self.local,
            tx,
            primaries.clone(),
            timeout,
            retries,
        )
        .await;
        if !delivery.undelivered.is_empty() {
            warn!(%tx, primaries = delivery.undelivered.len(), "commit outcome unknown on some primaries");
        }
        let failed: BTreeSet<SegmentId> = primaries
            .iter()
            .filter(|(node, _)| delivery.rejected.contains_key(*node))
            .flat_map(|(_, segments)| segments.iter().copied())
            .collect();

        let mut backups: BTreeMap<NodeId, Vec<SegmentId>> = BTreeMap::new();
        let mut abandoned: BTreeSet<NodeId> = BTreeSet::new();
        for segment in &written {
            for backup in current.owners_of(*segment).iter().skip(1) {
                if failed.contains(segment) {
                    abandoned.insert(*backup);
                } else {
                    backups.entry(*backup).or_default().push(*segment);
                }
            }
        }
        let finish = finish_commit(
            self.transport.clone(),
            self.local,
            tx,
            backups,
            abandoned,
            timeout,
            retries,
        );
        if self.config.sync_commit_phase {
            finish.await;
        } else {
            tokio::spawn(finish);
        }

        let elapsed = self.intents.remove(&tx).map(|(_, i)| i.started_at.elapsed());
        if !failed.is_empty() {
            ctx.set_status(TxStatus::RolledBack);
            if failed.len() < written.len() {
                warn!(%tx, failed = failed.len(), segments = written.len(), "commit applied on some segments only");
            }
            debug!(%tx, ?elapsed, "prepare expired before commit");
            return Err(TxError::Timeout);
        }

        ctx.set_status(TxStatus::Committed);
        debug!(%tx, ?elapsed, primaries = delivery.acked.len(), "committed");
        Ok(CommitReceipt {
            tx,
            versions: prepared,
        })
    }

    /// Rejects the commit if a touched segment changed owners since the
    /// transaction began or is still transferring.
    fn gate(
        &self,
        ctx: &TransactionContext,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<Arc<Topology>, TxError> {
        let (current, transferring) = self.view.snapshot_for(segments);
        let started = ctx.topology();
        let moved = segments
            .iter()
            .any(|s| started.owners_of(*s) != current.owners_of(*s));
        if moved || transferring {
            debug!(
                tx = %ctx.id(),
                started = started.id(),
                current = current.id(),
                moved,
                transferring,
                "topology gate closed"
            );
            return Err(TxError::TopologyChanged {
                started: started.id(),
                current: current.id(),
            });
        }
        Ok(current)
    }

    /// Runs both prepare rounds. Every node a prepare was sent to is added
    /// to `contacted`, whether or not it answered.
    async fn prepare_all(
        &self,
        ctx: &TransactionContext,
        topology: &Topology,
        contacted: &mut BTreeSet<NodeId>,
    ) -> Result<BTreeMap<Key, Version>, TxError> {
        let by_segment = ctx.writes_by_segment();

        let mut primaries = Vec::with_capacity(by_segment.len());
        for (segment, writes) in &by_segment {
            let primary = topology
                .primary_of(*segment)
                .ok_or(TxError::Unavailable { segment: *segment })?;
            let observed = ctx.observed_versions(writes.iter().map(|w| &w.key));
            let request = Request::Prepare(PrepareRequest {
                tx: ctx.id(),
                topology_id: topology.id(),
                segment: *segment,
                role: PrepareRole::Primary,
                writes: writes.clone(),
                observed,
            });
            primaries.push((primary, *segment, request));
        }
        contacted.extend(primaries.iter().map(|(node, _, _)| *node));

        let mut versions: BTreeMap<Key, Version> = BTreeMap::new();
        for (node, segment, result) in self.fan_out(primaries).await {
            match result {
                Ok(Response::Prepared { versions: assigned }) => versions.extend(assigned),
                other => return Err(self.prepare_failure(ctx, node, segment, other)),
            }
        }

        let mut backups = Vec::new();
        for (segment, writes) in &by_segment {
            let pinned: Vec<WriteOp> = writes
                .iter()
                .map(|w| WriteOp {
                    version: versions.get(&w.key).copied(),
                    ..w.clone()
                })
                .collect();
            for backup in topology.owners_of(*segment).iter().skip(1) {
                let request = Request::Prepare(PrepareRequest {
                    tx: ctx.id(),
                    topology_id: topology.id(),
                    segment: *segment,
                    role: PrepareRole::Backup,
                    writes: pinned.clone(),
                    observed: BTreeMap::new(),
                });
                backups.push((*backup, *segment, request));
            }
        }
        contacted.extend(backups.iter().map(|(node, _, _)| *node));

        for (node, segment, result) in self.fan_out(backups).await {
            if !matches!(result, Ok(Response::Prepared { .. })) {
                return Err(self.prepare_failure(ctx, node, segment, result));
            }
        }
        Ok(versions)
    }

    /// Sends all calls in parallel and collects every result.
    async fn fan_out(&self, calls: Vec<(NodeId, SegmentId, Request)>) -> Vec<CallResult> {
        let timeout = self.config.rpc_timeout();
        let mut pending: FuturesUnordered<_> = calls
            .into_iter()
            .map(|(node, segment, request)| {
                let transport = &*self.transport;
                let local = self.local;
                async move {
                    let result = call_with_timeout(transport, local, node, request, timeout).await;
                    (node, segment, result)
                }
            })
            .collect();

        let mut results = Vec::new();
        while let Some(result) = pending.next().await {
            results.push(result);
        }
        results
    }

    fn prepare_failure(
        &self,
        ctx: &TransactionContext,
        node: NodeId,
        segment: SegmentId,
        result: Result<Response, RpcError>,
    ) -> TxError {
        let topology_changed = || TxError::TopologyChanged {
            started: ctx.topology_id(),
            current: self.view.topology_id(),
        };
        match result {
            Ok(Response::Rejected(rejection)) => {
                debug!(tx = %ctx.id(), %node, segment, %rejection, "prepare rejected");
                match rejection {
                    Rejection::VersionMismatch {
                        key,
                        expected,
                        found,
                    } => TxError::WriteSkew {
                        key,
                        conflict: Conflict::VersionChanged { expected, found },
                    },
                    Rejection::LockBusy { key, holder } => TxError::WriteSkew {
                        key,
                        conflict: Conflict::Locked { holder },
                    },
                    Rejection::TopologyMismatch { .. }
                    | Rejection::SegmentTransferring { .. }
                    | Rejection::NotOwner { .. }
                    | Rejection::NotReady { .. } => topology_changed(),
                    Rejection::TimedOut | Rejection::AlreadyRolledBack => TxError::Timeout,
                }
            }
            Ok(other) => {
                warn!(tx = %ctx.id(), %node, ?other, "unexpected prepare response");
                TxError::Unavailable { segment }
            }
            Err(RpcError::Timeout(_)) => TxError::Timeout,
            Err(e) => {
                debug!(tx = %ctx.id(), segment, "prepare failed: {e}");
                TxError::Unavailable { segment }
            }
        }
    }

    async fn rollback_participants(&self, tx: TxId, nodes: &BTreeSet<NodeId>) {
        let calls = nodes
            .iter()
            .map(|n| (*n, 0, Request::Rollback { tx }))
            .collect();
        for (node, _, result) in self.fan_out(calls).await {
            if let Err(e) = result {
                // the participant's reaper releases whatever it still holds
                debug!(%tx, %node, "rollback not delivered: {e}");
            }
        }
    }
}

/// Acknowledgements of one commit round.
#[derive(Debug, Default)]
struct Delivery {
    acked: BTreeSet<NodeId>,
    rejected: BTreeMap<NodeId, Rejection>,
    /// Never answered, even after the retries.
    undelivered: BTreeSet<NodeId>,
}

/// Sends `Commit` for the listed segments to every node, re-sending failed
/// deliveries up to `retries` times.
async fn send_commits(
    transport: Arc<dyn Transport>,
    local: NodeId,
    tx: TxId,
    targets: BTreeMap<NodeId, Vec<SegmentId>>,
    timeout: Duration,
    retries: u32,
) -> Delivery {
    let mut delivery = Delivery::default();
    let mut remaining: Vec<(NodeId, Vec<SegmentId>)> = targets.into_iter().collect();
    for attempt in 0..=retries {
        let mut pending: FuturesUnordered<_> = std::mem::take(&mut remaining)
            .into_iter()
            .map(|(node, segments)| {
                let transport = transport.clone();
                async move {
                    let request = Request::Commit {
                        tx,
                        segments: segments.clone(),
                    };
                    let result = call_with_timeout(&*transport, local, node, request, timeout).await;
                    (node, segments, result)
                }
            })
            .collect();

        while let Some((node, segments, result)) = pending.next().await {
            match result {
                Ok(Response::Ack) => {
                    delivery.acked.insert(node);
                }
                Ok(Response::Rejected(rejection)) => {
                    // a rejection will not change on retry
                    warn!(%tx, %node, %rejection, "commit rejected");
                    delivery.rejected.insert(node, rejection);
                }
                Ok(other) => {
                    warn!(%tx, %node, ?other, "unexpected commit response");
                    delivery.undelivered.insert(node);
                }
                Err(e) => {
                    debug!(%tx, %node, attempt, "commit delivery failed: {e}");
                    remaining.push((node, segments));
                }
            }
        }
        if remaining.is_empty() {
            break;
        }
    }
    delivery
        .undelivered
        .extend(remaining.into_iter().map(|(node, _)| node));
    delivery
}

/// Commits the backups of every segment whose primary applied the
/// transaction, then rolls back the backups of the segments whose primary
/// refused it.
async fn finish_commit(
    transport: Arc<dyn Transport>,
    local: NodeId,
    tx: TxId,
    backups: BTreeMap<NodeId, Vec<SegmentId>>,
    abandoned: BTreeSet<NodeId>,
    timeout: Duration,
    retries: u32,
) {
    if !backups.is_empty() {
        let delivery = send_commits(transport.clone(), local, tx, backups, timeout, retries).await;
        if !delivery.rejected.is_empty() || !delivery.undelivered.is_empty() {
            warn!(
                %tx,
                rejected = delivery.rejected.len(),
                undelivered = delivery.undelivered.len(),
                "commit not applied by every backup"
            );
        }
    }
    // after the commits, so a node that is backup for both kinds of segment
    // keeps the ones it just applied
    for node in abandoned {
        if let Err(e) = call_with_timeout(&*transport, local, node, Request::Rollback { tx }, timeout).await {
            debug!(%tx, %node, "rollback not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LocalNetwork;
    use skein_cluster::{HashFunction, HashLayout};

    fn coordinator() -> TransactionCoordinator {
        let layout = HashLayout::new(16, 2, HashFunction::Murmur2).unwrap();
        let view = Arc::new(ClusterView::new(NodeId::new(), layout));
        TransactionCoordinator::new(
            Arc::new(ClusterConfig::default()),
            view,
            Arc::new(LocalNetwork::new()),
        )
    }

    fn in_flight(c: &TransactionCoordinator) -> TxId {
        let tx = c.begin().id();
        c.intents.insert(
            tx,
            Intent {
                phase: IntentPhase::Preparing,
                cancelled: false,
                started_at: Instant::now(),
            },
        );
        tx
    }

    #[test]
    fn cancel_before_commit_phase_wins() {
        let c = coordinator();
        let tx = in_flight(&c);
        assert!(c.cancel(tx));
        assert!(!c.begin_commit_phase(&tx));
    }

    #[test]
    fn cancel_after_commit_phase_is_refused() {
        let c = coordinator();
        let tx = in_flight(&c);
        assert!(c.begin_commit_phase(&tx));
        assert!(!c.cancel(tx));
    }

    #[test]
    fn cancel_and_commit_phase_never_both_succeed() {
        let c = coordinator();
        for _ in 0..200 {
            let tx = in_flight(&c);
            let (cancelled, committing) = std::thread::scope(|s| {
                let cancel = s.spawn(|| c.cancel(tx));
                let commit = s.spawn(|| c.begin_commit_phase(&tx));
                (cancel.join().unwrap(), commit.join().unwrap())
            });
            assert_ne!(cancelled, committing, "{tx}");
        }
    }

    #[test]
    fn unknown_transaction_cannot_enter_commit_phase() {
        let c = coordinator();
        let tx = c.begin().id();
        assert!(!c.begin_commit_phase(&tx));
        assert!(!c.cancel(tx));
    }
}
