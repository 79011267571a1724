//! Replica-side request handling.
//!
//! The participant answers reads, runs the prepare/commit/rollback half of
//! the commit protocol for the segments this node owns, and serves entry
//! batches to nodes pulling a segment.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use skein_cluster::{Key, SegmentId, TopologyId, Version};
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::locks::LockTable;
use crate::message::{PrepareRequest, PrepareRole, Rejection, Response, TxId};
use crate::store::VersionedEntryStore;
use crate::view::ClusterView;

/// Finished transactions remembered for commit/rollback deduplication.
const OUTCOME_RETENTION: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    RolledBack,
    TimedOut,
}

#[derive(Debug, Default)]
struct OutcomeLog {
    outcomes: HashMap<TxId, Outcome>,
    order: VecDeque<TxId>,
}

impl OutcomeLog {
    fn get(&self, tx: &TxId) -> Option<Outcome> {
        self.outcomes.get(tx).copied()
    }

    fn record(&mut self, tx: TxId, outcome: Outcome) {
        if self.outcomes.insert(tx, outcome).is_none() {
            self.order.push_back(tx);
        }
        while self.order.len() > OUTCOME_RETENTION {
            if let Some(old) = self.order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StagedWrite {
    key: Key,
    value: Option<Bytes>,
    /// Version the key had when it was locked.
    base: Version,
    version: Version,
}

#[derive(Debug)]
struct PreparedSegment {
    role: PrepareRole,
    writes: Vec<StagedWrite>,
}

impl PreparedSegment {
    fn versions(&self) -> BTreeMap<Key, Version> {
        self.writes
            .iter()
            .map(|w| (w.key.clone(), w.version))
            .collect()
    }
}

#[derive(Debug)]
struct PreparedTx {
    segments: BTreeMap<SegmentId, PreparedSegment>,
    prepared_at: Instant,
}

#[derive(Debug)]
pub struct Participant {
    config: Arc<ClusterConfig>,
    store: Arc<VersionedEntryStore>,
    view: Arc<ClusterView>,
    locks: LockTable,
    prepared: DashMap<TxId, PreparedTx>,
    outcomes: Mutex<OutcomeLog>,
}

impl Participant {
    pub fn new(
        config: Arc<ClusterConfig>,
        store: Arc<VersionedEntryStore>,
        view: Arc<ClusterView>,
    ) -> Self {
        Self {
            config,
            store,
            view,
            locks: LockTable::new(),
            prepared: DashMap::new(),
            outcomes: Mutex::new(OutcomeLog::default()),
        }
    }

    pub fn store(&self) -> &Arc<VersionedEntryStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Number of transactions currently prepared on this node.
    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    fn outcome(&self, tx: &TxId) -> Option<Outcome> {
        let log = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        log.get(tx)
    }

    fn record(&self, tx: TxId, outcome: Outcome) {
        let mut log = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        log.record(tx, outcome);
    }

    /// Serves a read for a key in `segment`.
    ///
    /// A new owner that has not received the segment yet blocks until it
    /// arrives, up to the RPC timeout.
    pub async fn read(&self, segment: SegmentId, key: Key, topology_id: TopologyId) -> Response {
        if topology_id > self.view.topology_id() {
            self.view
                .wait_for_topology(topology_id, self.config.rpc_timeout())
                .await;
        }
        let topology = self.view.topology();
        if !topology.owners_of(segment).contains(&self.view.local()) {
            return Response::Rejected(Rejection::NotOwner { segment });
        }
        if !self.view.holds(segment)
            && !self
                .view
                .wait_until_held(segment, self.config.rpc_timeout())
                .await
        {
            return Response::Rejected(Rejection::NotReady { segment });
        }
        let (value, version) = self.store.read(&key);
        Response::Value { value, version }
    }

    /// Validates and locks one segment's share of a transaction.
    pub fn prepare(&self, req: PrepareRequest) -> Response {
        let PrepareRequest {
            tx,
            topology_id,
            segment,
            role,
            writes,
            observed,
        } = req;

        match self.outcome(&tx) {
            Some(Outcome::TimedOut) => return Response::Rejected(Rejection::TimedOut),
            Some(_) => return Response::Rejected(Rejection::AlreadyRolledBack),
            None => {}
        }
        if let Some(existing) = self.prepared.get(&tx) {
            if let Some(seg) = existing.segments.get(&segment) {
                return Response::Prepared {
                    versions: seg.versions(),
                };
            }
        }

        if let Err(rejection) = self.check_placement(segment, topology_id, role) {
            debug!(%tx, segment, ?rejection, "prepare refused");
            return Response::Rejected(rejection);
        }

        let keys: Vec<Key> = writes.iter().map(|w| w.key.clone()).collect();
        if let Err((key, holder)) = self.locks.acquire_all(&keys, tx) {
            debug!(%tx, segment, %key, %holder, "prepare found key locked");
            return Response::Rejected(Rejection::LockBusy { key, holder });
        }

        // the topology may have moved while the locks were being taken
        if let Err(rejection) = self.check_placement(segment, topology_id, role) {
            self.locks.release_all(&keys, tx);
            return Response::Rejected(rejection);
        }

        let mut staged = Vec::with_capacity(writes.len());
        for op in writes {
            let current = self.store.version_of(&op.key);
            if role == PrepareRole::Primary && self.config.validates_versions() {
                if let Some(&expected) = observed.get(&op.key) {
                    if expected != current {
                        self.locks.release_all(&keys, tx);
                        debug!(%tx, segment, key = %op.key, %expected, found = %current, "write skew");
                        return Response::Rejected(Rejection::VersionMismatch {
                            key: op.key,
                            expected,
                            found: current,
                        });
                    }
                }
            }
            let version = match (role, op.version) {
                (PrepareRole::Backup, Some(pinned)) => pinned,
                _ => current.next(),
            };
            staged.push(StagedWrite {
                key: op.key,
                value: op.value,
                base: current,
                version,
            });
        }

        let prepared = PreparedSegment {
            role,
            writes: staged,
        };
        let versions = prepared.versions();
        self.prepared
            .entry(tx)
            .or_insert_with(|| PreparedTx {
                segments: BTreeMap::new(),
                prepared_at: Instant::now(),
            })
            .segments
            .insert(segment, prepared);

        // a rollback may have raced past the outcome check above
        if self.outcome(&tx).is_some() {
            self.discard(tx);
            return Response::Rejected(Rejection::AlreadyRolledBack);
        }

        debug!(%tx, segment, ?role, keys = versions.len(), "prepared");
        Response::Prepared { versions }
    }

    fn check_placement(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        role: PrepareRole,
    ) -> Result<(), Rejection> {
        let (topology, transferring) = self.view.snapshot_for(&BTreeSet::from([segment]));
        if topology.id() != topology_id {
            return Err(Rejection::TopologyMismatch {
                expected: topology_id,
                actual: topology.id(),
            });
        }
        if transferring {
            return Err(Rejection::SegmentTransferring { segment });
        }
        let local = self.view.local();
        let owners = topology.owners_of(segment);
        let placed = match role {
            PrepareRole::Primary => owners.first() == Some(&local),
            PrepareRole::Backup => owners.iter().skip(1).any(|n| *n == local),
        };
        if !placed {
            return Err(Rejection::NotOwner { segment });
        }
        if !self.view.holds(segment) {
            return Err(Rejection::NotReady { segment });
        }
        Ok(())
    }

    /// Applies the listed segments of a prepared `tx`. The coordinator
    /// commits primaries before backups, so one node may see several
    /// commits for the same transaction; it counts as committed once no
    /// prepared segment is left. Segments already applied are acknowledged
    /// without effect.
    pub fn commit(&self, tx: TxId, segments: &[SegmentId]) -> Response {
        match self.outcome(&tx) {
            Some(Outcome::Committed) => return Response::Ack,
            Some(Outcome::TimedOut) => return Response::Rejected(Rejection::TimedOut),
            Some(Outcome::RolledBack) => return Response::Rejected(Rejection::AlreadyRolledBack),
            None => {}
        }
        let taken: Vec<(SegmentId, PreparedSegment)> = {
            let Some(mut prepared) = self.prepared.get_mut(&tx) else {
                warn!(%tx, "commit for unknown transaction");
                return Response::Rejected(Rejection::TimedOut);
            };
            segments
                .iter()
                .filter_map(|s| prepared.segments.remove(s).map(|seg| (*s, seg)))
                .collect()
        };
        let finished = self
            .prepared
            .remove_if(&tx, |_, p| p.segments.is_empty())
            .is_some();

        for (segment, seg) in &taken {
            for w in &seg.writes {
                let applied = match seg.role {
                    PrepareRole::Primary => {
                        let out = self
                            .store
                            .compare_and_set(w.key.clone(), w.base, w.value.clone());
                        out.ok
                            || self
                                .store
                                .apply_versioned(w.key.clone(), w.value.clone(), w.version)
                    }
                    PrepareRole::Backup => {
                        self.store
                            .apply_versioned(w.key.clone(), w.value.clone(), w.version)
                    }
                };
                if !applied {
                    warn!(%tx, segment, key = %w.key, version = %w.version, "commit found newer version");
                }
            }
            self.locks.release_all(seg.writes.iter().map(|w| &w.key), tx);
        }
        if finished {
            self.record(tx, Outcome::Committed);
        }
        debug!(%tx, segments = taken.len(), finished, "committed");
        Response::Ack
    }

    /// Discards any prepared state of `tx` and releases its locks.
    pub fn rollback(&self, tx: TxId) -> Response {
        if self.outcome(&tx) == Some(Outcome::Committed) {
            warn!(%tx, "rollback after commit ignored");
            return Response::Ack;
        }
        self.discard(tx);
        if self.outcome(&tx).is_none() {
            self.record(tx, Outcome::RolledBack);
        }
        debug!(%tx, "rolled back");
        Response::Ack
    }

    /// Drops the prepared segments of `tx` that were not committed yet.
    /// Returns false if none are left.
    fn discard(&self, tx: TxId) -> bool {
        let Some((_, prepared)) = self
            .prepared
            .remove_if(&tx, |_, p| !p.segments.is_empty())
        else {
            return false;
        };
        for seg in prepared.segments.values() {
            self.locks.release_all(seg.writes.iter().map(|w| &w.key), tx);
        }
        true
    }

    /// Releases prepares older than the lock timeout. A later commit for a
    /// reaped transaction is rejected with `TimedOut`. Locks of a commit that
    /// is being applied right now are left to it.
    pub fn reap_expired(&self) -> usize {
        let timeout = self.config.lock_timeout();
        let mut stale = self.locks.expired(timeout);
        stale.extend(
            self.prepared
                .iter()
                .filter(|p| p.prepared_at.elapsed() >= timeout)
                .map(|p| *p.key()),
        );
        stale.sort();
        stale.dedup();

        let mut reaped = 0;
        for tx in stale {
            if self.discard(tx) {
                self.record(tx, Outcome::TimedOut);
                warn!(%tx, "prepare expired, locks released");
                reaped += 1;
            }
        }
        reaped
    }

    /// Serves one batch of a segment to a pulling owner.
    ///
    /// Waits until this node runs the puller's topology, so no new prepare
    /// for the segment can start here, and until in-flight prepares on the
    /// segment have finished.
    pub async fn transfer_pull(
        &self,
        segment: SegmentId,
        topology_id: TopologyId,
        after: Option<Key>,
        limit: usize,
    ) -> Response {
        if !self
            .view
            .wait_for_topology(topology_id, self.config.rpc_timeout())
            .await
        {
            return Response::Rejected(Rejection::TopologyMismatch {
                expected: topology_id,
                actual: self.view.topology_id(),
            });
        }
        if !self.view.holds(segment) {
            return Response::NotHolder;
        }

        let layout = self.view.topology().layout();
        let locked = self.locks.locked_keys(|k| layout.segment_of(k) == segment);
        if !locked.is_empty()
            && !self
                .locks
                .wait_released(&locked, self.config.transfer_timeout())
                .await
        {
            warn!(segment, keys = locked.len(), "transfer waited too long for locks");
            return Response::Rejected(Rejection::TimedOut);
        }

        let batch = self.store.segment_batch(segment, after.as_ref(), limit);
        debug!(segment, entries = batch.len(), done = batch.done, "served transfer batch");
        Response::Batch(batch)
    }
}
