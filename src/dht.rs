//! # Peer Table
//!
//! The set of known peers, their dialable addresses, and named subnets.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `add_peer(sig, addr)` | Insert or refresh a peer; evicts the least recently contacted when full |
//! | `delete_peer(sig)` | Remove a peer (idempotent) |
//! | `peer_address(sig)` | Look up a peer's address |
//! | `addresses(n)` | Up to `n` peers chosen uniformly at random |
//! | `add_subnet(members)` | Register a subnet, returning its hash |
//!
//! ## Eviction
//!
//! Peers are kept in LRU order of last contact: `add_peer` and `touch`
//! move a record to the most-recent end, lookups do not. When the table is
//! full the record at the least-recent end is evicted, so the most recently
//! contacted peers always survive.
//!
//! The table never removes peers on its own account beyond the capacity
//! bound. Callers that see a send fail decide whether to `delete_peer`.
//!
//! ## Actor Architecture
//!
//! - [`PeerTable`]: plain synchronous data structure
//! - [`Dht`]: public handle; commands go over a channel to a single actor
//!   task that owns the table, so concurrent discovery, gossip and transport
//!   callers never share it directly
//! - The handle also fronts the node's [`ContentResolver`]
//! - The actor is owned by its handles, not by `Node::run`: it exits when
//!   the last [`Dht`] clone is dropped, so the table stays readable before
//!   and after the node runs

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use lru::LruCache;
use rand::seq::{IteratorRandom, SliceRandom};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::content::{Content, ContentError, ContentResolver};
use crate::identity::{Hash, Signatory, now_ms};

/// Default maximum number of peers tracked.
pub const DEFAULT_PEER_CAPACITY: usize = 1024;

/// Default maximum number of registered subnets.
pub const DEFAULT_MAX_SUBNETS: usize = 256;

/// Maximum members per subnet.
/// SECURITY: Bounds memory held for a single subnet registration.
pub const MAX_SUBNET_MEMBERS: usize = 4096;

/// Subnet hash addressing every peer in the table.
pub const GLOBAL_SUBNET: Hash = [0u8; 32];

/// Compute the hash naming a subnet of `members`.
///
/// Order and duplicates do not matter.
pub fn subnet_hash(members: &[Signatory]) -> Hash {
    let mut sorted: Vec<&Signatory> = members.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"driftnet-subnet-v1:");
    for member in sorted {
        hasher.update(member.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub signatory: Signatory,
    pub addr: String,
    /// Milliseconds since the Unix epoch of the last successful contact.
    pub last_seen_ms: u64,
}

#[derive(Clone, Debug)]
pub struct PeerTableConfig {
    pub capacity: usize,
    pub max_subnets: usize,
}

impl Default for PeerTableConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PEER_CAPACITY,
            max_subnets: DEFAULT_MAX_SUBNETS,
        }
    }
}

// ============================================================================
// PeerTable
// ============================================================================

pub struct PeerTable {
    local: Signatory,
    peers: LruCache<Signatory, PeerRecord>,
    subnets: LruCache<Hash, Vec<Signatory>>,
}

impl PeerTable {
    pub fn new(local: Signatory, config: &PeerTableConfig) -> Self {
        Self {
            local,
            peers: LruCache::new(NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN)),
            subnets: LruCache::new(NonZeroUsize::new(config.max_subnets).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Insert or refresh a peer. Returns the record evicted to make room, if any.
    pub fn add_peer(&mut self, signatory: Signatory, addr: String) -> Option<PeerRecord> {
        if signatory == self.local {
            return None;
        }
        let record = PeerRecord {
            signatory,
            addr,
            last_seen_ms: now_ms(),
        };
        match self.peers.push(signatory, record) {
            Some((evicted, record)) if evicted != signatory => Some(record),
            _ => None,
        }
    }

    /// Mark a known peer as just contacted. Returns false for unknown peers.
    pub fn touch(&mut self, signatory: &Signatory) -> bool {
        match self.peers.get_mut(signatory) {
            Some(record) => {
                record.last_seen_ms = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn delete_peer(&mut self, signatory: &Signatory) -> Option<PeerRecord> {
        self.peers.pop(signatory)
    }

    pub fn peer_address(&self, signatory: &Signatory) -> Option<&str> {
        self.peers.peek(signatory).map(|r| r.addr.as_str())
    }

    /// Up to `n` peers sampled uniformly without replacement, in random order.
    pub fn addresses(&self, n: usize) -> Vec<Signatory> {
        let mut rng = rand::thread_rng();
        let mut picked = self
            .peers
            .iter()
            .map(|(signatory, _)| *signatory)
            .choose_multiple(&mut rng, n);
        picked.shuffle(&mut rng);
        picked
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All records, most recently contacted first.
    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn add_subnet(&mut self, members: Vec<Signatory>) -> Hash {
        let mut members = members;
        members.sort();
        members.dedup();
        members.truncate(MAX_SUBNET_MEMBERS);
        let hash = subnet_hash(&members);
        self.subnets.put(hash, members);
        hash
    }

    pub fn subnet(&self, hash: &Hash) -> Vec<Signatory> {
        self.subnets.peek(hash).cloned().unwrap_or_default()
    }

    pub fn delete_subnet(&mut self, hash: &Hash) {
        self.subnets.pop(hash);
    }
}

// ============================================================================
// Dht handle and actor
// ============================================================================

#[derive(Clone)]
pub struct Dht {
    cmd_tx: mpsc::Sender<Command>,
    local: Signatory,
    content: Arc<dyn ContentResolver>,
}

struct DhtActor {
    table: PeerTable,
    cmd_rx: mpsc::Receiver<Command>,
}

enum Command {
    AddPeer(Signatory, String),
    DeletePeer(Signatory),
    Touch(Signatory),
    PeerAddress(Signatory, oneshot::Sender<Option<String>>),
    Addresses(usize, oneshot::Sender<Vec<Signatory>>),
    Records(oneshot::Sender<Vec<PeerRecord>>),
    AddSubnet(Vec<Signatory>, oneshot::Sender<Hash>),
    Subnet(Hash, oneshot::Sender<Vec<Signatory>>),
    DeleteSubnet(Hash),
}

impl Dht {
    /// Spawn the table actor. It runs until every handle is dropped.
    pub fn new(local: Signatory, config: PeerTableConfig, content: Arc<dyn ContentResolver>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = DhtActor {
            table: PeerTable::new(local, &config),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            local,
            content,
        }
    }

    pub fn signatory(&self) -> Signatory {
        self.local
    }

    pub async fn add_peer(&self, signatory: Signatory, addr: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::AddPeer(signatory, addr.into())).await;
    }

    pub async fn delete_peer(&self, signatory: Signatory) {
        let _ = self.cmd_tx.send(Command::DeletePeer(signatory)).await;
    }

    pub async fn touch_peer(&self, signatory: Signatory) {
        let _ = self.cmd_tx.send(Command::Touch(signatory)).await;
    }

    pub async fn peer_address(&self, signatory: &Signatory) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::PeerAddress(*signatory, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn addresses(&self, n: usize) -> Vec<Signatory> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Addresses(n, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Records(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn num_peers(&self) -> usize {
        self.peers().await.len()
    }

    pub async fn add_subnet(&self, members: Vec<Signatory>) -> Result<Hash> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddSubnet(members, tx))
            .await
            .map_err(|_| anyhow::anyhow!("dht actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("dht actor closed"))
    }

    pub async fn subnet(&self, hash: &Hash) -> Vec<Signatory> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Subnet(*hash, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn delete_subnet(&self, hash: &Hash) {
        let _ = self.cmd_tx.send(Command::DeleteSubnet(*hash)).await;
    }

    pub fn content_resolver(&self) -> &Arc<dyn ContentResolver> {
        &self.content
    }

    pub fn insert_content(&self, digest: Hash, content_type: u8, data: Vec<u8>) -> Result<(), ContentError> {
        self.content.insert_content(digest, content_type, data)
    }

    pub fn content(&self, digest: &Hash) -> Option<Content> {
        self.content.content(digest)
    }

    pub fn has_content(&self, digest: &Hash) -> bool {
        self.content.has_content(digest)
    }

    pub fn delete_content(&self, digest: &Hash) {
        self.content.delete_content(digest)
    }
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddPeer(signatory, addr) => {
                    trace!(peer = %hex::encode(&signatory.as_bytes()[..8]), addr = %addr, "add peer");
                    if let Some(evicted) = self.table.add_peer(signatory, addr) {
                        debug!(
                            evicted = %hex::encode(&evicted.signatory.as_bytes()[..8]),
                            "peer table full, evicted least recently contacted peer"
                        );
                    }
                }
                Command::DeletePeer(signatory) => {
                    if self.table.delete_peer(&signatory).is_some() {
                        debug!(peer = %hex::encode(&signatory.as_bytes()[..8]), "peer removed");
                    }
                }
                Command::Touch(signatory) => {
                    self.table.touch(&signatory);
                }
                Command::PeerAddress(signatory, reply) => {
                    let _ = reply.send(self.table.peer_address(&signatory).map(str::to_owned));
                }
                Command::Addresses(n, reply) => {
                    let _ = reply.send(self.table.addresses(n));
                }
                Command::Records(reply) => {
                    let _ = reply.send(self.table.records());
                }
                Command::AddSubnet(members, reply) => {
                    let _ = reply.send(self.table.add_subnet(members));
                }
                Command::Subnet(hash, reply) => {
                    let _ = reply.send(self.table.subnet(&hash));
                }
                Command::DeleteSubnet(hash) => {
                    self.table.delete_subnet(&hash);
                }
            }
        }
        trace!("dht actor stopped");
    }
}
