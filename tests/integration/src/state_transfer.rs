//! Segments moving between owners on join and crash.

use std::collections::BTreeMap;
use std::time::Duration;

use skein_cluster::{Key, Version};
use skein_core::{ClusterConfig, LocalCluster, PrepareRequest, PrepareRole, Response, TxId, WriteOp};

use crate::helpers::{config, start, val, SETTLE};

/// Writes `count` keys, removes every tenth, and returns what each key
/// should hold afterwards.
async fn populate(cluster: &LocalCluster, count: usize) -> BTreeMap<Key, (Option<bytes::Bytes>, Version)> {
    let mut expected = BTreeMap::new();
    for i in 0..count {
        let node = &cluster.nodes()[i % cluster.nodes().len()];
        let key = Key::from(format!("doc:{i}"));
        let receipt = node.write(key.clone(), val(&format!("v{i}"))).await.unwrap();
        expected.insert(key.clone(), (Some(val(&format!("v{i}"))), receipt.versions[&key]));
        if i % 10 == 0 {
            let receipt = node.delete(key.clone()).await.unwrap();
            expected.insert(key.clone(), (None, receipt.versions[&key]));
        }
    }
    expected
}

/// Every owner of every key holds the expected value and version.
fn assert_complete(cluster: &LocalCluster, expected: &BTreeMap<Key, (Option<bytes::Bytes>, Version)>) {
    for node in cluster.nodes() {
        let topology = node.view().topology();
        for (key, want) in expected {
            if topology.owners_of(topology.segment_of(key)).contains(&node.id()) {
                assert_eq!(&node.store().read(key), want, "{key} on {}", node.id());
            }
        }
    }
}

#[tokio::test]
async fn join_moves_values_with_versions() {
    let mut cluster = start(3, config()).await;
    let expected = populate(&cluster, 300).await;

    let joiner = cluster.add_node().unwrap();
    assert!(cluster.await_stable(SETTLE).await);
    assert!(joiner.store().len() > 0);
    assert_complete(&cluster, &expected);

    for (key, (value, _)) in &expected {
        assert_eq!(&joiner.read(key).await.unwrap(), value);
    }
}

#[tokio::test]
async fn former_owners_drop_their_copies() {
    let mut cluster = start(2, config()).await;
    let expected = populate(&cluster, 200).await;

    // rf=2 on two nodes: both hold everything until the others join
    assert_eq!(cluster.nodes()[0].store().len(), expected.len());
    cluster.add_node().unwrap();
    cluster.add_node().unwrap();
    assert!(cluster.await_stable(SETTLE).await);
    assert_complete(&cluster, &expected);

    let layout = cluster.nodes()[0].view().topology().layout();
    for node in cluster.nodes() {
        let topology = node.view().topology();
        for key in expected.keys() {
            let segment = layout.segment_of(key);
            if !topology.owners_of(segment).contains(&node.id()) {
                assert_eq!(node.store().read(key).1, Version(0), "{key} kept on {}", node.id());
            }
        }
    }
}

#[tokio::test]
async fn crash_recovers_from_surviving_backup() {
    let mut cluster = start(4, config()).await;
    let expected = populate(&cluster, 300).await;

    let victim = cluster.nodes()[1].id();
    assert!(cluster.stop_node(&victim));
    assert!(cluster.await_stable(SETTLE).await);
    assert_complete(&cluster, &expected);

    for node in cluster.nodes() {
        assert!(node.transfers().data_loss_reports().is_empty());
    }
}

#[tokio::test]
async fn single_copy_crash_reports_data_loss() {
    let cfg = ClusterConfig {
        replication_factor: 1,
        ..config()
    };
    let mut cluster = start(3, cfg).await;
    let expected = populate(&cluster, 120).await;
    let mut losses = cluster.nodes()[0].transfers().subscribe_data_loss();

    let victim = cluster.nodes()[2].id();
    let topology = cluster.nodes()[0].view().topology();
    let orphaned = topology.view().segments_owned_by(&victim);
    assert!(cluster.stop_node(&victim));
    assert!(cluster.await_stable(SETTLE).await);

    let report = losses.recv().await.unwrap();
    assert!(orphaned.contains(&report.segment));
    assert_eq!(report.lost_holders, vec![victim]);

    let reader = cluster.nodes()[0].clone();
    for (key, (value, _)) in &expected {
        let got = reader.read(key).await.unwrap();
        if orphaned.contains(&topology.segment_of(key)) {
            assert_eq!(got, None);
        } else {
            assert_eq!(&got, value);
        }
    }

    // the emptied segments take writes again
    let key = expected
        .keys()
        .find(|k| orphaned.contains(&topology.segment_of(k)))
        .unwrap()
        .clone();
    reader.write(key.clone(), val("fresh")).await.unwrap();
    assert_eq!(reader.read(&key).await.unwrap(), Some(val("fresh")));
}

#[tokio::test]
async fn reads_during_transfer_see_committed_values() {
    let mut cluster = start(2, config()).await;
    let expected = populate(&cluster, 150).await;

    let joiner = cluster.add_node().unwrap();
    assert!(joiner.view().wait_for_topology(cluster.topology_id(), SETTLE).await);
    // no wait for the transfers: the joiner serves as soon as it learns the view, blocking
    // reads on segments it has not received yet
    for (key, (value, _)) in &expected {
        assert_eq!(&joiner.read(key).await.unwrap(), value);
    }
    assert!(cluster.await_stable(SETTLE).await);
}

#[tokio::test]
async fn overlapping_joins_settle() {
    let mut cluster = start(3, config()).await;
    let expected = populate(&cluster, 200).await;

    for _ in 0..3 {
        cluster.add_node().unwrap();
    }
    assert!(cluster.await_stable(SETTLE).await);
    assert_eq!(cluster.topology_id(), 4);
    assert_complete(&cluster, &expected);
}

#[tokio::test]
async fn locked_source_delays_transfer_without_loss() {
    let cfg = ClusterConfig {
        replication_factor: 1,
        transfer_timeout_ms: 200,
        ..config()
    };
    let mut cluster = start(1, cfg).await;
    let expected = populate(&cluster, 100).await;
    let source = cluster.nodes()[0].clone();
    let topology = source.view().topology();

    // a prepared transaction on every segment keeps the source from serving
    let mut by_segment: BTreeMap<_, Vec<Key>> = BTreeMap::new();
    for key in expected.keys() {
        by_segment.entry(topology.segment_of(key)).or_default().push(key.clone());
    }
    let mut held = Vec::new();
    for (i, (segment, keys)) in by_segment.into_iter().enumerate() {
        let tx = TxId {
            origin: source.id(),
            seq: u64::MAX - i as u64,
        };
        let writes = keys
            .into_iter()
            .map(|key| WriteOp {
                key,
                value: Some(val("pending")),
                version: None,
            })
            .collect();
        let response = source.participant().prepare(PrepareRequest {
            tx,
            topology_id: topology.id(),
            segment,
            role: PrepareRole::Primary,
            writes,
            observed: BTreeMap::new(),
        });
        assert!(matches!(response, Response::Prepared { .. }), "{response:?}");
        held.push(tx);
    }

    let joiner = cluster.add_node().unwrap();
    assert!(!cluster.await_stable(Duration::from_millis(800)).await);
    for node in cluster.nodes() {
        assert!(node.transfers().data_loss_reports().is_empty());
    }

    for tx in held {
        source.participant().rollback(tx);
    }
    assert!(cluster.await_stable(SETTLE).await);
    for node in cluster.nodes() {
        assert!(node.transfers().data_loss_reports().is_empty());
    }
    assert_complete(&cluster, &expected);
    for (key, (value, _)) in &expected {
        assert_eq!(&joiner.read(key).await.unwrap(), value);
    }
}
