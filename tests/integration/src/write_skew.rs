//! Conflicts between a transaction's reads and writes committed after them.

use skein_core::{Conflict, TxError};

use crate::helpers::{config, key_avoiding, start, val, SETTLE};

#[tokio::test]
async fn suspended_transaction_loses_across_join_and_crash() {
    let mut cluster = start(4, config()).await;
    let a = cluster.nodes()[0].clone();
    let b = cluster.nodes()[1].clone();

    // keep both clients off the key's replica set so stopping an owner
    // never takes a client down with it
    let key = key_avoiding(&a.view().topology(), &[a.id(), b.id()]);
    a.write(key.clone(), val("world")).await.unwrap();

    let mut t1 = b.begin();
    assert_eq!(b.get(&mut t1, &key).await.unwrap(), Some(val("world")));

    let joiner = cluster.add_node().unwrap().id();
    assert!(cluster.await_stable(SETTLE).await);

    // a single join cannot displace both original owners
    let topology = a.view().topology();
    let owner = *topology
        .owners_of(topology.segment_of(&key))
        .iter()
        .find(|o| ![a.id(), b.id(), joiner].contains(*o))
        .expect("an original owner remains");
    assert!(cluster.stop_node(&owner));
    assert!(cluster.await_stable(SETTLE).await);

    a.write(key.clone(), val("new world")).await.unwrap();

    b.put(&mut t1, key.clone(), val("world2")).unwrap();
    let err = b.commit(t1).await.unwrap_err();
    assert!(
        matches!(err, TxError::WriteSkew { .. } | TxError::TopologyChanged { .. }),
        "unexpected error: {err}"
    );
    assert!(err.is_retryable());

    for node in cluster.nodes() {
        assert_eq!(node.read(&key).await.unwrap(), Some(val("new world")));
    }
}

#[tokio::test]
async fn concurrent_writer_invalidates_read() {
    let cluster = start(3, config()).await;
    let (n0, n1) = (cluster.nodes()[0].clone(), cluster.nodes()[1].clone());
    let key = skein_cluster::Key::from("balance");
    n0.write(key.clone(), val("100")).await.unwrap();

    let mut t1 = n1.begin();
    assert_eq!(n1.get(&mut t1, &key).await.unwrap(), Some(val("100")));

    let winner = n0.write(key.clone(), val("50")).await.unwrap();

    n1.put(&mut t1, key.clone(), val("150")).unwrap();
    match n1.commit(t1).await {
        Err(TxError::WriteSkew {
            key: conflicted,
            conflict: Conflict::VersionChanged { expected, found },
        }) => {
            assert_eq!(conflicted, key);
            assert!(found > expected);
            assert_eq!(found, winner.versions[&key]);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    assert_eq!(n1.read(&key).await.unwrap(), Some(val("50")));
}

#[tokio::test]
async fn removed_key_still_detects_skew() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();
    let key = skein_cluster::Key::from("ephemeral");
    node.write(key.clone(), val("here")).await.unwrap();

    let mut t1 = node.begin();
    assert!(node.get(&mut t1, &key).await.unwrap().is_some());

    node.delete(key.clone()).await.unwrap();

    node.put(&mut t1, key.clone(), val("resurrected")).unwrap();
    assert!(matches!(
        node.commit(t1).await,
        Err(TxError::WriteSkew { .. })
    ));
    assert_eq!(node.read(&key).await.unwrap(), None);
}

#[tokio::test]
async fn both_readers_cannot_commit() {
    let cluster = start(3, config()).await;
    let node = cluster.nodes()[2].clone();
    let (x, y) = (skein_cluster::Key::from("x"), skein_cluster::Key::from("y"));

    let mut t1 = node.begin();
    let mut t2 = node.begin();
    node.get(&mut t1, &x).await.unwrap();
    node.get(&mut t1, &y).await.unwrap();
    node.get(&mut t2, &x).await.unwrap();
    node.get(&mut t2, &y).await.unwrap();

    // classic write skew: each writes the key the other only read
    node.put(&mut t1, x.clone(), val("t1")).unwrap();
    node.put(&mut t1, y.clone(), val("t1")).unwrap();
    node.put(&mut t2, y.clone(), val("t2")).unwrap();
    node.put(&mut t2, x.clone(), val("t2")).unwrap();

    node.commit(t1).await.unwrap();
    assert!(matches!(
        node.commit(t2).await,
        Err(TxError::WriteSkew { .. })
    ));
    assert_eq!(node.read(&x).await.unwrap(), Some(val("t1")));
    assert_eq!(node.read(&y).await.unwrap(), Some(val("t1")));
}

#[tokio::test]
async fn unrelated_topology_change_does_not_abort() {
    let mut cluster = start(3, config()).await;
    let node = cluster.nodes()[0].clone();

    let mut pending = Vec::new();
    for i in 0..40 {
        let key = skein_cluster::Key::from(format!("item-{i}"));
        node.write(key.clone(), val("0")).await.unwrap();
        let mut ctx = node.begin();
        node.get(&mut ctx, &key).await.unwrap();
        pending.push((key, ctx));
    }

    cluster.add_node().unwrap();
    assert!(cluster.await_stable(SETTLE).await);
    let current = node.view().topology();

    let (mut committed, mut aborted) = (0, 0);
    for (key, mut ctx) in pending {
        let segment = current.segment_of(&key);
        let moved = ctx.topology().owners_of(segment) != current.owners_of(segment);
        node.put(&mut ctx, key.clone(), val("1")).unwrap();
        match node.commit(ctx).await {
            Ok(_) => {
                assert!(!moved);
                committed += 1;
            }
            Err(TxError::TopologyChanged { started, current: now }) => {
                assert!(moved);
                assert!(now > started);
                aborted += 1;
            }
            Err(e) => panic!("unexpected error for {key}: {e}"),
        }
    }
    assert!(committed > 0);
    assert!(aborted > 0);
}
