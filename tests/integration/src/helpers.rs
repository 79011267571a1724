//! Shared setup for the end-to-end scenarios.

use std::time::Duration;

use bytes::Bytes;
use skein_cluster::{Key, NodeId, Topology};
use skein_core::{ClusterConfig, LocalCluster};

/// Upper bound for a cluster to settle after a membership change.
pub const SETTLE: Duration = Duration::from_secs(15);

/// Small layout and short timeouts so failures surface quickly.
pub fn config() -> ClusterConfig {
    ClusterConfig {
        num_segments: 32,
        rpc_timeout_ms: 1_000,
        transfer_timeout_ms: 5_000,
        reaper_interval_ms: 100,
        ..ClusterConfig::default()
    }
}

/// Starts `size` nodes and waits for the first view to settle.
pub async fn start(size: usize, config: ClusterConfig) -> LocalCluster {
    let cluster = LocalCluster::start(size, config).expect("valid config");
    assert!(cluster.await_stable(SETTLE).await, "cluster did not settle");
    cluster
}

pub fn val(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Finds a key none of whose owners in `topology` is in `avoid`.
pub fn key_avoiding(topology: &Topology, avoid: &[NodeId]) -> Key {
    (0..100_000u32)
        .map(|i| Key::from(format!("key-{i}")))
        .find(|k| {
            let owners = topology.owners_of(topology.segment_of(k));
            owners.iter().all(|o| !avoid.contains(o))
        })
        .expect("some key avoids the given nodes")
}
