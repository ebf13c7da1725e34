//! Integration tests for discovery and gossip over real TCP connections.
//!
//! Every node binds an ephemeral localhost port and runs until the test
//! flips the shared shutdown flag.

use std::time::{Duration, Instant};

use anyhow::Result;
use driftnet::{
    DialPolicy, DiscoveryConfig, GLOBAL_SUBNET, GossipConfig, Hash, Keypair, Node, NodeBuilder,
    TransportConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Cluster {
    nodes: Vec<Node>,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Cluster {
    async fn start(n: usize, discovery_interval: Duration) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let mut nodes = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let node = builder(discovery_interval)
                .build("127.0.0.1:0")
                .await
                .expect("bind failed");
            let runner = node.clone();
            let rx = stop_rx.clone();
            handles.push(tokio::spawn(async move { runner.run(rx).await }));
            nodes.push(node);
        }
        Self { nodes, stop, handles }
    }

    async fn full_mesh(&self) {
        for node in &self.nodes {
            for other in &self.nodes {
                if node.signatory() != other.signatory() {
                    node.add_peer(other.signatory(), other.local_addr().to_string()).await;
                }
            }
        }
    }

    async fn shutdown(self) {
        self.stop.send(true).expect("nodes still listening");
        for handle in self.handles {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("node did not stop")
                .expect("node task panicked")
                .expect("node returned an error");
        }
    }
}

fn builder(discovery_interval: Duration) -> NodeBuilder {
    Node::builder()
        .with_gossip_config(
            GossipConfig::default()
                .with_timeout(Duration::from_millis(500))
                .with_max_attempts(6),
        )
        .with_discovery_config(DiscoveryConfig {
            ping_interval: discovery_interval,
            max_expected_peers: 16,
            ..Default::default()
        })
        .with_transport_config(TransportConfig {
            dial_timeout: Duration::from_secs(1),
            dial_policy: DialPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(100),
            },
            ..Default::default()
        })
}

async fn wait_for_content(nodes: &[Node], digest: &Hash) {
    timeout(TEST_TIMEOUT, async {
        while !nodes.iter().all(|n| n.content(digest).is_some()) {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("content did not reach every node");
}

#[tokio::test]
async fn five_node_broadcast_reaches_everyone() {
    let cluster = Cluster::start(5, Duration::from_secs(60)).await;
    cluster.full_mesh().await;

    let mut receivers = Vec::new();
    for node in &cluster.nodes[1..] {
        receivers.push(node.received().await.unwrap());
    }

    let digest = cluster.nodes[0]
        .broadcast(GLOBAL_SUBNET, 7, b"to every node".to_vec())
        .await
        .unwrap();
    wait_for_content(&cluster.nodes, &digest).await;

    for rx in &mut receivers {
        let got = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.digest, digest);
        assert_eq!(got.data, b"to every node");
        assert_eq!(got.content_type, 7);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn subnet_broadcast_skips_outsiders() {
    let cluster = Cluster::start(6, Duration::from_secs(60)).await;
    cluster.full_mesh().await;

    let members: Vec<_> = cluster.nodes[..5].iter().map(|n| n.signatory()).collect();
    let mut subnet = GLOBAL_SUBNET;
    for node in &cluster.nodes {
        subnet = node.add_subnet(members.clone()).await.unwrap();
    }

    let digest = cluster.nodes[0]
        .broadcast(subnet, 0, b"members only".to_vec())
        .await
        .unwrap();
    wait_for_content(&cluster.nodes[..5], &digest).await;

    sleep(Duration::from_millis(300)).await;
    assert!(cluster.nodes[5].content(&digest).is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn direct_send_reaches_target_only() {
    let cluster = Cluster::start(3, Duration::from_secs(60)).await;
    cluster.full_mesh().await;

    let mut rx = cluster.nodes[1].received().await.unwrap();
    let digest = cluster.nodes[0]
        .send(cluster.nodes[1].signatory(), 2, b"just for you".to_vec())
        .await
        .unwrap();

    let got = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.digest, digest);
    assert_eq!(got.from, cluster.nodes[0].signatory());
    assert_eq!(got.target, cluster.nodes[1].signatory().hash());

    sleep(Duration::from_millis(300)).await;
    assert!(cluster.nodes[2].content(&digest).is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn chain_discovery_converges() {
    let cluster = Cluster::start(5, Duration::from_millis(100)).await;
    for pair in cluster.nodes.windows(2) {
        pair[0]
            .add_peer(pair[1].signatory(), pair[1].local_addr().to_string())
            .await;
    }

    let expected = cluster.nodes.len() - 1;
    timeout(TEST_TIMEOUT, async {
        loop {
            let mut done = true;
            for node in &cluster.nodes {
                if node.peers().await.len() != expected {
                    done = false;
                }
            }
            if done {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peer tables did not converge");

    for node in &cluster.nodes {
        for record in node.peers().await {
            let owner = cluster
                .nodes
                .iter()
                .find(|n| n.signatory() == record.signatory)
                .expect("unknown peer in table");
            assert_eq!(record.addr, owner.local_addr().to_string());
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn send_to_unreachable_peer_evicts_it() {
    let cluster = Cluster::start(1, Duration::from_secs(60)).await;
    let node = &cluster.nodes[0];

    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let ghost = Keypair::generate().signatory();
    node.add_peer(ghost, dead_addr).await;
    assert_eq!(node.peers().await.len(), 1);

    let started = Instant::now();
    node.send(ghost, 0, b"anyone there?".to_vec()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "send must not wait on the dial");

    timeout(Duration::from_secs(3), async {
        while !node.peers().await.is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("unreachable peer was not evicted within the dial timeout");

    cluster.shutdown().await;
}
