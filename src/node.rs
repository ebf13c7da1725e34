//! # High-Level Node API
//!
//! A [`Node`] wires the peer table, content resolver, transport, discovery
//! and gossip into one process-level handle.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0").await?;
//! node.add_peer(bootstrap_signatory, "10.0.0.7:4100").await;
//!
//! let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let runner = node.clone();
//! tokio::spawn(async move { runner.run(stop_rx).await });
//!
//! let digest = node.broadcast(GLOBAL_SUBNET, 1, b"hello".to_vec()).await?;
//! let mut rx = node.received().await?;
//! while let Some(content) = rx.recv().await {
//!     println!("{} bytes from {}", content.data.len(), content.from);
//! }
//! ```
//!
//! ## Message Routing
//!
//! | Stage | Handler |
//! |-------|---------|
//! | middleware | version filter, peer last-contact refresh |
//! | `Ping`, `PingAck` | [`PeerDiscovery`] |
//! | `Push`, `Pull`, `Syn` | [`Gossiper`] |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::info;

use crate::content::{Content, ContentResolver, DoubleCacheConfig, DoubleCacheContentResolver};
use crate::dht::{Dht, PeerRecord, PeerTableConfig};
use crate::discovery::{DiscoveryConfig, PeerDiscovery};
use crate::gossip::{GossipConfig, Gossiper, ReceivedContent};
use crate::identity::{Hash, Keypair, Signatory, digest};
use crate::messages::MsgType;
use crate::router::{PeerTouch, Router, VersionFilter};
use crate::transport::{Transport, TransportConfig};

type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Default)]
pub struct NodeBuilder {
    keypair: Option<Keypair>,
    content: Option<Arc<dyn ContentResolver>>,
    advertised_addr: Option<String>,
    peer_table: PeerTableConfig,
    content_config: DoubleCacheConfig,
    gossip: GossipConfig,
    discovery: DiscoveryConfig,
    transport: TransportConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Replace the in-memory double cache with another resolver.
    pub fn with_content_resolver(mut self, content: Arc<dyn ContentResolver>) -> Self {
        self.content = Some(content);
        self
    }

    /// Address other peers should dial, when it differs from the bound one.
    pub fn with_advertised_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertised_addr = Some(addr.into());
        self
    }

    pub fn with_peer_capacity(mut self, capacity: usize) -> Self {
        self.peer_table.capacity = capacity;
        self
    }

    pub fn with_content_config(mut self, config: DoubleCacheConfig) -> Self {
        self.content_config = config;
        self
    }

    pub fn with_gossip_config(mut self, config: GossipConfig) -> Self {
        self.gossip = config;
        self
    }

    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery = config;
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    pub async fn build(self, addr: &str) -> Result<Node> {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let signatory = keypair.signatory();

        let transport = Transport::bind(keypair.clone(), addr, self.transport)
            .await
            .context("failed to start transport")?;
        let advertised = self
            .advertised_addr
            .unwrap_or_else(|| transport.local_addr().to_string());

        let content = self
            .content
            .unwrap_or_else(|| Arc::new(DoubleCacheContentResolver::new(self.content_config, None)));
        let dht = Dht::new(signatory, self.peer_table, content);

        let sender = Arc::new(transport.clone());
        let discovery = Arc::new(PeerDiscovery::new(
            keypair,
            advertised.clone(),
            self.discovery,
            dht.clone(),
            sender.clone(),
        ));
        let (gossiper, received) = Gossiper::new(signatory, self.gossip, dht.clone(), sender);

        Ok(Node {
            inner: Arc::new(NodeInner {
                signatory,
                advertised,
                dht,
                transport,
                discovery,
                gossiper: Arc::new(gossiper),
                received: Mutex::new(Some(received)),
            }),
        })
    }
}

struct NodeInner {
    signatory: Signatory,
    advertised: String,
    dht: Dht,
    transport: Transport,
    discovery: Arc<PeerDiscovery<Transport>>,
    gossiper: Arc<Gossiper<Transport>>,
    received: TakeOnce<ReceivedContent>,
}

/// Cheap-to-clone handle to a running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Bind with a fresh keypair and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        NodeBuilder::new().build(addr).await
    }

    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn signatory(&self) -> Signatory {
        self.inner.signatory
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// The address this node signs into its pings.
    pub fn advertised_addr(&self) -> &str {
        &self.inner.advertised
    }

    /// Store `data` and gossip it to one peer. Returns its digest.
    pub async fn send(&self, to: Signatory, content_type: u8, data: Vec<u8>) -> Result<Hash> {
        self.publish(to.hash(), content_type, data).await
    }

    /// Store `data` and gossip it across `subnet`. Returns its digest.
    ///
    /// [`GLOBAL_SUBNET`](crate::dht::GLOBAL_SUBNET) reaches the whole network.
    pub async fn broadcast(&self, subnet: Hash, content_type: u8, data: Vec<u8>) -> Result<Hash> {
        self.publish(subnet, content_type, data).await
    }

    async fn publish(&self, target: Hash, content_type: u8, data: Vec<u8>) -> Result<Hash> {
        let key = digest(&data);
        self.inner
            .dht
            .insert_content(key, content_type, data)
            .context("failed to store content")?;
        self.inner.gossiper.gossip(target, key).await?;
        Ok(key)
    }

    /// Run transport, discovery and gossip until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let inner = &self.inner;
        let router = Router::new()
            .middleware(Arc::new(VersionFilter))
            .middleware(Arc::new(PeerTouch::new(inner.dht.clone())))
            .route(MsgType::Ping, inner.discovery.clone())
            .route(MsgType::PingAck, inner.discovery.clone())
            .route(MsgType::Push, inner.gossiper.clone())
            .route(MsgType::Pull, inner.gossiper.clone())
            .route(MsgType::Syn, inner.gossiper.clone());

        info!(
            signatory = %inner.signatory,
            addr = %inner.transport.local_addr(),
            "node running"
        );
        let (transport, discovery, gossip) = tokio::join!(
            inner.transport.run(router, shutdown.clone()),
            inner.discovery.run(shutdown.clone()),
            inner.gossiper.run(shutdown),
        );
        transport.context("transport failed")?;
        discovery.context("discovery failed")?;
        gossip.context("gossip failed")?;
        info!("node stopped");
        Ok(())
    }

    /// Add or refresh a peer, e.g. a bootstrap contact.
    pub async fn add_peer(&self, signatory: Signatory, addr: impl Into<String>) {
        self.inner.dht.add_peer(signatory, addr).await;
    }

    pub async fn add_subnet(&self, members: Vec<Signatory>) -> Result<Hash> {
        self.inner.dht.add_subnet(members).await
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.dht.peers().await
    }

    pub fn content(&self, digest: &Hash) -> Option<Content> {
        self.inner.dht.content(digest)
    }

    pub fn num_rumors(&self) -> usize {
        self.inner.gossiper.num_rumors()
    }

    pub fn is_connected(&self, peer: &Signatory) -> bool {
        self.inner.transport.is_connected(peer)
    }

    /// Content delivered by gossip. Can be taken once.
    pub async fn received(&self) -> Result<mpsc::Receiver<ReceivedContent>> {
        self.inner
            .received
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("content receiver already taken"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::GLOBAL_SUBNET;

    #[tokio::test]
    async fn send_stores_content_under_its_digest() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        let peer = Keypair::generate().signatory();
        let key = node.send(peer, 4, b"payload".to_vec()).await.unwrap();

        assert_eq!(key, digest(b"payload"));
        let stored = node.content(&key).unwrap();
        assert_eq!(stored.data, b"payload");
        assert_eq!(stored.content_type, 4);
    }

    #[tokio::test]
    async fn broadcast_returns_digest() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        let key = node.broadcast(GLOBAL_SUBNET, 0, b"to all".to_vec()).await.unwrap();
        assert!(node.content(&key).is_some());
    }

    #[tokio::test]
    async fn received_can_be_taken_once() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        assert!(node.received().await.is_ok());
        assert!(node.received().await.is_err());
    }

    #[tokio::test]
    async fn builder_applies_keypair_and_advertised_address() {
        let keypair = Keypair::generate();
        let node = Node::builder()
            .with_keypair(keypair.clone())
            .with_advertised_addr("203.0.113.9:4100")
            .build("127.0.0.1:0")
            .await
            .unwrap();
        assert_eq!(node.signatory(), keypair.signatory());
        assert_eq!(node.advertised_addr(), "203.0.113.9:4100");
        assert_ne!(node.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run(stop_rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn run_future_can_be_spawned() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let run = node.run(stop_rx);
        assert_send(&run);
    }

    #[tokio::test]
    async fn peer_table_outlives_run() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        let peer = Keypair::generate().signatory();
        node.add_peer(peer, "127.0.0.1:1").await;

        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        node.run(stop_rx).await.unwrap();

        let peers = node.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].signatory, peer);
    }
}
