//! Transaction lifecycle through the public node API.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use skein_cluster::{Key, NodeId, Version};
use skein_core::{
    ClusterConfig, IsolationLevel, LocalNetwork, Request, Response, RpcError,
    TransactionCoordinator, Transport, TxError, TxStatus,
};

use crate::helpers::{config, start, val};

#[tokio::test]
async fn commit_then_read_sees_larger_version() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let key = Key::from("user:1");

    let first = node.write(key.clone(), val("alice")).await.unwrap();
    let mut ctx = node.begin();
    assert_eq!(node.get(&mut ctx, &key).await.unwrap(), Some(val("alice")));
    node.put(&mut ctx, key.clone(), val("alicia")).unwrap();
    let second = node.commit(ctx).await.unwrap();
    assert!(second.versions[&key] > first.versions[&key]);

    let other = cluster.nodes()[2].clone();
    assert_eq!(other.read(&key).await.unwrap(), Some(val("alicia")));
    for n in cluster.nodes() {
        let (_, version) = n.store().read(&key);
        assert!(version == Version(0) || version == second.versions[&key]);
    }
}

#[tokio::test]
async fn reads_see_own_buffered_writes() {
    let cluster = start(2, config()).await;
    let node = cluster.nodes()[1].clone();
    let (k1, k2) = (Key::from("a"), Key::from("b"));
    node.write(k2.clone(), val("before")).await.unwrap();

    let mut ctx = node.begin();
    node.put(&mut ctx, k1.clone(), val("pending")).unwrap();
    node.remove(&mut ctx, k2.clone()).unwrap();
    assert_eq!(node.get(&mut ctx, &k1).await.unwrap(), Some(val("pending")));
    assert_eq!(node.get(&mut ctx, &k2).await.unwrap(), None);

    // nothing is visible until commit
    assert_eq!(node.read(&k1).await.unwrap(), None);
    assert_eq!(node.read(&k2).await.unwrap(), Some(val("before")));

    node.commit(ctx).await.unwrap();
    assert_eq!(node.read(&k1).await.unwrap(), Some(val("pending")));
    assert_eq!(node.read(&k2).await.unwrap(), None);
}

#[tokio::test]
async fn read_only_commit_touches_nothing() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let mut ctx = node.begin();
    assert_eq!(node.get(&mut ctx, &Key::from("missing")).await.unwrap(), None);
    let receipt = node.commit(ctx).await.unwrap();
    assert!(receipt.versions.is_empty());
    for n in cluster.nodes() {
        assert!(n.store().is_empty());
    }
}

#[tokio::test]
async fn rollback_discards_writes() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let key = Key::from("draft");

    let mut ctx = node.begin();
    node.put(&mut ctx, key.clone(), val("unsaved")).unwrap();
    assert_eq!(ctx.status(), TxStatus::Active);
    node.rollback(ctx).unwrap();
    assert_eq!(node.read(&key).await.unwrap(), None);
}

#[tokio::test]
async fn many_segments_commit_atomically() {
    let cluster = start(4, config()).await;
    let node = cluster.nodes()[3].clone();

    let mut ctx = node.begin();
    for i in 0..64 {
        node.put(&mut ctx, Key::from(format!("batch:{i}")), val(&i.to_string()))
            .unwrap();
    }
    let receipt = node.commit(ctx).await.unwrap();
    assert_eq!(receipt.versions.len(), 64);

    let reader = cluster.nodes()[0].clone();
    for i in 0..64 {
        let value = reader.read(&Key::from(format!("batch:{i}"))).await.unwrap();
        assert_eq!(value, Some(val(&i.to_string())));
    }
    for n in cluster.nodes() {
        assert_eq!(n.participant().locks().len(), 0);
        assert_eq!(n.participant().prepared_count(), 0);
    }
}

#[tokio::test]
async fn duplicate_commit_and_late_rollback_are_harmless() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let key = Key::from("once");
    let receipt = node.write(key.clone(), val("v1")).await.unwrap();

    let network: &LocalNetwork = cluster.network();
    let topology = node.view().topology();
    for owner in topology.owners_of(topology.segment_of(&key)) {
        let again = network
            .call(
                node.id(),
                *owner,
                Request::Commit {
                    tx: receipt.tx,
                    segments: vec![topology.segment_of(&key)],
                },
            )
            .await
            .unwrap();
        assert_eq!(again, Response::Ack);
        let late = network
            .call(node.id(), *owner, Request::Rollback { tx: receipt.tx })
            .await
            .unwrap();
        assert_eq!(late, Response::Ack);
    }

    for owner in topology.owners_of(topology.segment_of(&key)) {
        let store = cluster.find(owner).unwrap().store().clone();
        assert_eq!(store.read(&key), (Some(val("v1")), receipt.versions[&key]));
    }
}

#[tokio::test]
async fn read_committed_is_last_writer_wins() {
    let cfg = ClusterConfig {
        isolation: IsolationLevel::ReadCommitted,
        ..config()
    };
    let cluster = start(3, cfg).await;
    let node = cluster.nodes()[0].clone();
    let key = Key::from("lww");
    node.write(key.clone(), val("first")).await.unwrap();

    let mut t1 = node.begin();
    node.get(&mut t1, &key).await.unwrap();
    node.write(key.clone(), val("second")).await.unwrap();

    node.put(&mut t1, key.clone(), val("third")).unwrap();
    node.commit(t1).await.unwrap();
    assert_eq!(node.read(&key).await.unwrap(), Some(val("third")));
}

#[tokio::test]
async fn cancel_needs_a_commit_in_flight() {
    let cluster = start(2, config()).await;
    let node = cluster.nodes()[0].clone();
    let ctx = node.begin();
    assert!(!node.cancel(ctx.id()));
    node.rollback(ctx).unwrap();
    assert_eq!(node.coordinator().in_flight(), 0);
}

#[tokio::test]
async fn unreachable_backup_aborts_as_unavailable() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let victim = cluster.nodes()[1].id();
    let topology = node.view().topology();
    let key = (0..10_000u32)
        .map(|i| Key::from(format!("key-{i}")))
        .find(|k| {
            let owners = topology.owners_of(topology.segment_of(k));
            owners[1] == victim && owners[0] != node.id()
        })
        .unwrap();

    // crash without telling the membership service
    cluster.network().deregister(&victim);

    let mut ctx = node.begin();
    node.put(&mut ctx, key.clone(), val("lost")).unwrap();
    let err = node.commit(ctx).await.unwrap_err();
    assert!(matches!(err, TxError::Unavailable { .. }), "{err}");
    assert!(err.is_retryable());

    // the primary was rolled back, so its lock is gone and nothing applied
    let primary = cluster.find(&topology.owners_of(topology.segment_of(&key))[0]).unwrap();
    assert!(!primary.participant().locks().is_locked(&key));
    assert_eq!(primary.store().read(&key), (None, Version(0)));
}

/// Holds every `Commit` back for a while before it reaches the network.
struct SlowCommits {
    network: LocalNetwork,
    delay: Duration,
}

impl Transport for SlowCommits {
    fn call(
        &self,
        from: NodeId,
        to: NodeId,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, RpcError>> {
        let network = self.network.clone();
        let delay = self.delay;
        Box::pin(async move {
            if matches!(request, Request::Commit { .. }) {
                tokio::time::sleep(delay).await;
            }
            network.call(from, to, request).await
        })
    }
}

#[tokio::test]
async fn commit_after_lock_expiry_times_out() {
    let cfg = ClusterConfig {
        lock_timeout_ms: 100,
        reaper_interval_ms: 10,
        ..config()
    };
    let cluster = start(3, cfg.clone()).await;
    let origin = cluster.nodes()[0].clone();
    let coordinator = TransactionCoordinator::new(
        Arc::new(cfg),
        origin.view().clone(),
        Arc::new(SlowCommits {
            network: cluster.network().clone(),
            delay: Duration::from_millis(400),
        }),
    );
    let key = Key::from("too-slow");

    let mut ctx = coordinator.begin();
    coordinator.put(&mut ctx, key.clone(), val("never")).unwrap();
    assert_eq!(coordinator.commit(ctx).await.unwrap_err(), TxError::Timeout);

    for node in cluster.nodes() {
        assert_eq!(node.store().read(&key), (None, Version(0)), "on {}", node.id());
        assert!(!node.participant().locks().is_locked(&key));
        assert_eq!(node.participant().prepared_count(), 0);
    }

    // the key is free for the next writer
    let other = cluster.nodes()[1].clone();
    assert_eq!(other.read(&key).await.unwrap(), None);
    other.write(key.clone(), val("later")).await.unwrap();
    assert_eq!(other.read(&key).await.unwrap(), Some(val("later")));
}
