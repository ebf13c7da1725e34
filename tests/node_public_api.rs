//! Integration tests for the Node public API.
//!
//! These tests exercise the facade without relying on other nodes.

use std::sync::Arc;
use std::time::Duration;

use driftnet::{
    ContentResolver, DoubleCacheConfig, DoubleCacheContentResolver, GLOBAL_SUBNET, Keypair, Node,
    Signatory, digest, subnet_hash,
};
use tokio::sync::watch;
use tokio::time::timeout;

const TEST_ADDR: &str = "127.0.0.1:0";

#[tokio::test]
async fn node_bind_and_signatory() {
    let node = Node::bind(TEST_ADDR).await.expect("bind failed");

    let hex = node.signatory().to_hex();
    assert_eq!(hex.len(), 64, "signatory should be 64 hex chars");
    assert!(node.signatory().is_valid());
    assert!(node.local_addr().port() > 0, "port should be assigned");
    assert_eq!(node.advertised_addr(), node.local_addr().to_string());
}

#[tokio::test]
async fn builder_uses_given_keypair() {
    let keypair = Keypair::generate();
    let node = Node::builder()
        .with_keypair(keypair.clone())
        .build(TEST_ADDR)
        .await
        .expect("bind failed");
    assert_eq!(node.signatory(), keypair.signatory());
}

#[tokio::test]
async fn bind_to_taken_port_fails() {
    let first = Node::bind(TEST_ADDR).await.unwrap();
    let taken = first.local_addr().to_string();
    assert!(Node::bind(&taken).await.is_err());
}

#[tokio::test]
async fn add_peer_and_list() {
    let node = Node::bind(TEST_ADDR).await.unwrap();
    let a = Keypair::generate().signatory();
    let b = Keypair::generate().signatory();

    node.add_peer(a, "127.0.0.1:1").await;
    node.add_peer(b, "127.0.0.1:2").await;
    node.add_peer(node.signatory(), "127.0.0.1:3").await;

    let peers = node.peers().await;
    assert_eq!(peers.len(), 2, "own signatory is never a peer");
    assert!(peers.iter().any(|p| p.signatory == a && p.addr == "127.0.0.1:1"));
    assert!(peers.iter().any(|p| p.signatory == b && p.addr == "127.0.0.1:2"));
}

#[tokio::test]
async fn peer_capacity_is_enforced() {
    let node = Node::builder()
        .with_peer_capacity(3)
        .build(TEST_ADDR)
        .await
        .unwrap();
    let sigs: Vec<Signatory> = (0..5).map(|_| Keypair::generate().signatory()).collect();
    for (i, sig) in sigs.iter().enumerate() {
        node.add_peer(*sig, format!("127.0.0.1:{}", 1000 + i)).await;
    }

    let peers = node.peers().await;
    assert_eq!(peers.len(), 3);
    for recent in &sigs[2..] {
        assert!(peers.iter().any(|p| p.signatory == *recent));
    }
}

#[tokio::test]
async fn add_subnet_is_order_independent() {
    let node = Node::bind(TEST_ADDR).await.unwrap();
    let members: Vec<Signatory> = (0..4).map(|_| Keypair::generate().signatory()).collect();
    let mut reversed = members.clone();
    reversed.reverse();

    let hash = node.add_subnet(members.clone()).await.unwrap();
    assert_eq!(hash, subnet_hash(&members));
    assert_eq!(node.add_subnet(reversed).await.unwrap(), hash);
    assert_ne!(hash, GLOBAL_SUBNET);
}

#[tokio::test]
async fn broadcast_and_send_store_content() {
    let node = Node::bind(TEST_ADDR).await.unwrap();

    let d1 = node.broadcast(GLOBAL_SUBNET, 3, b"first".to_vec()).await.unwrap();
    let d2 = node
        .send(Keypair::generate().signatory(), 4, b"second".to_vec())
        .await
        .unwrap();

    assert_eq!(d1, digest(b"first"));
    assert_eq!(d2, digest(b"second"));
    assert_eq!(node.content(&d1).unwrap().content_type, 3);
    assert_eq!(node.content(&d2).unwrap().data, b"second");
}

#[tokio::test]
async fn oversized_content_is_rejected() {
    let node = Node::builder()
        .with_content_config(DoubleCacheConfig {
            max_content_size: 8,
            ..Default::default()
        })
        .build(TEST_ADDR)
        .await
        .unwrap();
    assert!(node.broadcast(GLOBAL_SUBNET, 0, vec![0u8; 9]).await.is_err());
}

#[tokio::test]
async fn custom_content_resolver_is_used() {
    let store = Arc::new(DoubleCacheContentResolver::default());
    let node = Node::builder()
        .with_content_resolver(store.clone())
        .build(TEST_ADDR)
        .await
        .unwrap();

    let key = node.broadcast(GLOBAL_SUBNET, 0, b"shared".to_vec()).await.unwrap();
    assert!(store.has_content(&key));
}

#[tokio::test]
async fn received_is_take_once() {
    let node = Node::bind(TEST_ADDR).await.unwrap();
    assert!(node.received().await.is_ok());
    assert!(node.received().await.is_err());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let node = Node::bind(TEST_ADDR).await.unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = node.clone();
    let handle = tokio::spawn(async move { runner.run(stop_rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should exit promptly")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn run_exits_when_shutdown_sender_is_dropped() {
    let node = Node::bind(TEST_ADDR).await.unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = node.clone();
    let handle = tokio::spawn(async move { runner.run(stop_rx).await });

    drop(stop_tx);
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should exit once the shutdown sender is gone")
        .unwrap()
        .unwrap();
}
