//! Two-member clusters: joining, follower write forwarding, replicated metadata.

mod common;

use std::time::Duration;

use common::TEST_TIMEOUT;
use common::eventually;
use common::resource;
use common::start_joined;
use common::start_single;
use registry::KeyValueStore;
use registry::RegistryError;
use registry::tree::NodeType;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_and_forward_follower_writes() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_single(&leader_dir).await;
    let follower = start_joined(&follower_dir, &leader.addr()).await;

    assert!(leader.cluster().is_leader());
    assert!(!follower.cluster().is_leader());
    assert_eq!(follower.cluster().leader().as_deref(), Some(leader.addr().as_str()));
    let mut peers = leader.cluster().peers();
    peers.sort();
    let mut expected = vec![leader.addr(), follower.addr()];
    expected.sort();
    assert_eq!(peers, expected);

    // The local store refuses; the facade forwards.
    let local = follower.cluster().store().update(b"loda", b"k", b"v").await;
    assert!(matches!(local, Err(RegistryError::NotLeader)));
    follower.cluster().update(b"loda", b"k", b"v").await.unwrap();

    for node in [&leader, &follower] {
        let replicated = eventually(Duration::from_secs(1), || async move {
            node.cluster().view(b"loda", b"k").await.ok().flatten() == Some(b"v".to_vec())
        })
        .await;
        assert!(replicated, "write not visible on {}", node.addr());
    }

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_api_peers_published_by_every_member() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_single(&leader_dir).await;
    let follower = start_joined(&follower_dir, &leader.addr()).await;

    let (l, f) = (&leader, &follower);
    let both = eventually(TEST_TIMEOUT, || async move {
        let peers = l.cluster().api_peers();
        peers.contains_key(&l.addr()) && peers.contains_key(&f.addr())
    })
    .await;
    assert!(both);

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_serves_tree_and_resource_writes() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_single(&leader_dir).await;
    let follower = start_joined(&follower_dir, &leader.addr()).await;

    // Wait until the seeded tree has reached the follower.
    let (l, f) = (&leader, &follower);
    assert!(eventually(TEST_TIMEOUT, || async move { f.tree().get_by_ns("pool.loda").await.is_ok() }).await);

    follower.tree().new_node("edge", "loda", NodeType::Leaf, "edge-").await.unwrap();
    assert!(eventually(TEST_TIMEOUT, || async move { f.tree().get_by_ns("edge.loda").await.is_ok() }).await);
    follower
        .machines()
        .register_machine(resource(&[("hostname", "edge-1"), ("ip", "10.9.0.1")]))
        .await
        .unwrap();

    let visible = eventually(TEST_TIMEOUT, || async move {
        l.resources()
            .get_resource_list("edge.loda", "machine")
            .await
            .map(|list| list.len() == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(visible);

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backup_is_leader_only() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = start_single(&leader_dir).await;
    let follower = start_joined(&follower_dir, &leader.addr()).await;

    let image: serde_json::Value = serde_json::from_slice(&leader.cluster().backup().unwrap()).unwrap();
    assert!(image["buckets"].get("loda").is_some());
    assert!(matches!(follower.cluster().backup(), Err(RegistryError::NotLeader)));

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}
