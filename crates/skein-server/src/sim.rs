//! The embedded-cluster simulation.
//!
//! Clients increment a small set of shared counters through read-modify-
//! write transactions while the cluster gains a node and then loses one.
//! Every increment that reports a successful commit must show up in the
//! final counter values; lost or doubled increments mean the commit or
//! transfer protocol let an update slip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use rand::Rng;
use skein_cluster::Key;
use skein_core::{AbortReason, ConfigError, LocalCluster, Node, TxError};
use tracing::{info, warn};

use crate::config::{ServerConfig, WorkloadConfig};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cluster did not settle after {phase}")]
    Unsettled { phase: &'static str },
    #[error("failed to read counter {key}: {source}")]
    Read { key: Key, source: TxError },
}

/// Abort counts by reason.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Aborts {
    pub write_skew: u64,
    pub topology_changed: u64,
    pub timeout: u64,
    pub unavailable: u64,
}

impl Aborts {
    fn record(&mut self, err: &TxError) {
        match err.reason() {
            Some(AbortReason::WriteSkew) => self.write_skew += 1,
            Some(AbortReason::TopologyChanged) => self.topology_changed += 1,
            Some(AbortReason::Timeout) => self.timeout += 1,
            Some(AbortReason::Unavailable) | None => self.unavailable += 1,
        }
    }

    fn merge(&mut self, other: Aborts) {
        self.write_skew += other.write_skew;
        self.topology_changed += other.topology_changed;
        self.timeout += other.timeout;
        self.unavailable += other.unavailable;
    }

    pub fn total(&self) -> u64 {
        self.write_skew + self.topology_changed + self.timeout + self.unavailable
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ClientStats {
    committed: u64,
    gave_up: u64,
    aborts: Aborts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub committed: u64,
    pub gave_up: u64,
    pub aborts: Aborts,
    /// Sum of every counter as read back after the run.
    pub observed: u64,
    pub topology_id: u64,
    pub data_loss: usize,
    pub elapsed: Duration,
}

impl Report {
    pub fn is_consistent(&self) -> bool {
        self.observed == self.committed && self.data_loss == 0
    }
}

pub async fn run(cfg: &ServerConfig) -> Result<Report, SimError> {
    let started = Instant::now();
    let mut cluster = LocalCluster::start(cfg.nodes, cfg.cluster.clone())?;
    settle(&cluster, cfg, "start").await?;
    info!(
        nodes = cfg.nodes,
        segments = cfg.cluster.num_segments,
        replication_factor = cfg.cluster.replication_factor,
        "cluster started"
    );

    let workload = &cfg.workload;
    // the crash victim never serves clients, so every client outlives it
    let victim = (workload.crash && cluster.nodes().len() > 1)
        .then(|| cluster.nodes()[cluster.nodes().len() - 1].id());
    let entry_points: Vec<Arc<Node>> = cluster
        .nodes()
        .iter()
        .filter(|n| Some(n.id()) != victim)
        .cloned()
        .collect();
    let entry_points = if entry_points.is_empty() {
        cluster.nodes().to_vec()
    } else {
        entry_points
    };

    let counters: Vec<Key> = (0..workload.counters)
        .map(|i| Key::from(format!("counter:{i}")))
        .collect();

    let clients: Vec<_> = (0..workload.clients)
        .map(|client| {
            let nodes = entry_points.clone();
            let counters = counters.clone();
            let workload = workload.clone();
            tokio::spawn(async move { run_client(client, nodes, counters, workload).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(workload.churn_after_ms)).await;
    if workload.join {
        let joined = cluster.add_node()?;
        info!(node = %joined.id(), "node joined");
        settle(&cluster, cfg, "join").await?;
    }
    if let Some(victim) = victim {
        cluster.stop_node(&victim);
        info!(node = %victim, "node crashed");
        settle(&cluster, cfg, "crash").await?;
    }

    let mut stats = ClientStats::default();
    for result in join_all(clients).await {
        match result {
            Ok(client) => {
                stats.committed += client.committed;
                stats.gave_up += client.gave_up;
                stats.aborts.merge(client.aborts);
            }
            Err(e) => warn!("client task failed: {e}"),
        }
    }
    settle(&cluster, cfg, "workload").await?;

    let reader = cluster
        .nodes()
        .first()
        .cloned()
        .ok_or(SimError::Unsettled { phase: "workload" })?;
    let mut observed = 0;
    for key in &counters {
        let value = reader.read(key).await.map_err(|source| SimError::Read {
            key: key.clone(),
            source,
        })?;
        observed += decode(value.as_ref());
    }

    let data_loss = cluster
        .nodes()
        .iter()
        .map(|n| n.transfers().data_loss_reports().len())
        .sum();

    Ok(Report {
        committed: stats.committed,
        gave_up: stats.gave_up,
        aborts: stats.aborts,
        observed,
        topology_id: cluster.topology_id(),
        data_loss,
        elapsed: started.elapsed(),
    })
}

async fn settle(cluster: &LocalCluster, cfg: &ServerConfig, phase: &'static str) -> Result<(), SimError> {
    if cluster.await_stable(cfg.settle_timeout()).await {
        Ok(())
    } else {
        Err(SimError::Unsettled { phase })
    }
}

async fn run_client(
    client: usize,
    nodes: Vec<Arc<Node>>,
    counters: Vec<Key>,
    workload: WorkloadConfig,
) -> ClientStats {
    let mut stats = ClientStats::default();
    for _ in 0..workload.increments {
        let (node, key) = {
            let mut rng = rand::rng();
            let node = nodes[rng.random_range(0..nodes.len())].clone();
            let key = counters[rng.random_range(0..counters.len())].clone();
            (node, key)
        };

        let mut done = false;
        for _ in 0..workload.max_attempts {
            match increment(&node, &key).await {
                Ok(()) => {
                    stats.committed += 1;
                    done = true;
                    break;
                }
                Err(e) if e.is_retryable() => {
                    stats.aborts.record(&e);
                    let pause = rand::rng().random_range(0..=workload.backoff_ms);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => {
                    stats.aborts.record(&e);
                    break;
                }
            }
        }
        if !done {
            warn!(client, %key, "giving up on increment");
            stats.gave_up += 1;
        }
    }
    stats
}

async fn increment(node: &Node, key: &Key) -> Result<(), TxError> {
    let mut ctx = node.begin();
    let current = node.get(&mut ctx, key).await?;
    let next = decode(current.as_ref()) + 1;
    node.put(&mut ctx, key.clone(), Bytes::from(next.to_string()))?;
    node.commit(ctx).await?;
    Ok(())
}

fn decode(value: Option<&Bytes>) -> u64 {
    value
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
