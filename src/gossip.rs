//! # Gossip Dissemination
//!
//! Spreads content by digest. A rumor announces one digest toward one
//! target, either a single peer or a subnet, and payloads only move on
//! request:
//!
//! ```text
//!   A                               B
//!   |--- Push(target, digest) ----->|  B lacks digest, records a pending pull
//!   |<-- Pull(target, digest) ------|
//!   |--- Syn{digest, type, bytes} ->|  B verifies, stores, notifies listener,
//!                                      then starts its own rumor for target
//! ```
//!
//! ## Rumors
//!
//! | Target | Pool |
//! |--------|------|
//! | a peer's signatory | that peer |
//! | a registered subnet | the subnet's members |
//! | [`GLOBAL_SUBNET`] | `alpha` random peers from the table |
//!
//! The local node and the peer the content came from are never in the pool.
//! Each round picks up to `alpha` pool members. For every slot, with
//! probability `bias` the pick is a member not contacted yet, otherwise it
//! is uniform over every remaining member. A successful send marks the
//! member contacted; a failed one removes it from the pool and evicts it
//! from the peer table.
//!
//! A rumor completes once every pool member has been contacted and expires
//! after `max_attempts` rounds or `timeout * max_attempts`, whichever comes
//! first. Retry rounds run every `timeout`. At most `max_capacity` rumors
//! are live; the least recently progressing one is evicted first.
//!
//! Contacted means the send was accepted by the transport, not that the peer
//! confirmed receipt.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace, warn};

use crate::dht::{Dht, GLOBAL_SUBNET};
use crate::identity::{Hash, Signatory};
use crate::messages::{Msg, MsgType, SynBody, deserialize_bounded, serialize};
use crate::protocols::{Flow, MessageHandler, MessageSender, shutdown_requested};

/// Default number of peers contacted per round.
pub const DEFAULT_ALPHA: usize = 10;

/// Default probability of preferring a peer not yet contacted.
pub const DEFAULT_BIAS: f64 = 0.25;

/// Default interval between retry rounds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum number of live rumors.
pub const DEFAULT_MAX_CAPACITY: usize = 4096;

/// Default number of rounds before a rumor expires.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Maximum outstanding pulls.
/// SECURITY: Bounds state created by unsolicited pushes.
pub const MAX_PENDING_PULLS: usize = 4096;

const COMMAND_QUEUE_CAPACITY: usize = 1024;
const RECEIVED_QUEUE_CAPACITY: usize = 1024;

type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub alpha: usize,
    pub bias: f64,
    pub timeout: Duration,
    pub max_capacity: usize,
    pub max_attempts: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            bias: DEFAULT_BIAS,
            timeout: DEFAULT_TIMEOUT,
            max_capacity: DEFAULT_MAX_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl GossipConfig {
    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = clamp_probability(bias);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }
}

/// Content that arrived through gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedContent {
    /// Peer that served the payload.
    pub from: Signatory,
    /// Rumor target: this node's signatory bytes or a subnet hash.
    pub target: Hash,
    pub digest: Hash,
    pub content_type: u8,
    pub data: Vec<u8>,
}

enum Command {
    Gossip { target: Hash, digest: Hash },
    Inbound { from: Signatory, msg: Msg },
}

// ============================================================================
// Gossiper handle
// ============================================================================

pub struct Gossiper<S: MessageSender> {
    local: Signatory,
    config: GossipConfig,
    dht: Dht,
    sender: Arc<S>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: TakeOnce<Command>,
    received_tx: mpsc::Sender<ReceivedContent>,
    num_rumors: Arc<AtomicUsize>,
}

impl<S: MessageSender> Gossiper<S> {
    /// Create the gossiper and the receiver for content it accepts.
    ///
    /// Nothing is sent until [`Gossiper::run`] is driven; rumors requested
    /// earlier are queued.
    pub fn new(
        local: Signatory,
        config: GossipConfig,
        dht: Dht,
        sender: Arc<S>,
    ) -> (Self, mpsc::Receiver<ReceivedContent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (received_tx, received_rx) = mpsc::channel(RECEIVED_QUEUE_CAPACITY);
        let gossiper = Self {
            local,
            config,
            dht,
            sender,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            received_tx,
            num_rumors: Arc::new(AtomicUsize::new(0)),
        };
        (gossiper, received_rx)
    }

    /// Start a rumor announcing `digest` toward `target`.
    ///
    /// The content must already be in the node's content resolver.
    pub async fn gossip(&self, target: Hash, digest: Hash) -> Result<()> {
        self.cmd_tx
            .send(Command::Gossip { target, digest })
            .await
            .map_err(|_| anyhow!("gossip actor closed"))
    }

    /// Live rumors.
    pub fn num_rumors(&self) -> usize {
        self.num_rumors.load(Ordering::Relaxed)
    }

    /// Drive rumors until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("gossiper is already running"))?;

        let actor = GossipActor {
            local: self.local,
            config: self.config.clone(),
            dht: self.dht.clone(),
            sender: self.sender.clone(),
            rumors: LruCache::new(NonZeroUsize::new(self.config.max_capacity).unwrap_or(NonZeroUsize::MIN)),
            pulls: LruCache::new(NonZeroUsize::new(MAX_PENDING_PULLS).unwrap_or(NonZeroUsize::MIN)),
            received_tx: self.received_tx.clone(),
            num_rumors: self.num_rumors.clone(),
            rng: StdRng::from_entropy(),
            sends: JoinSet::new(),
            replies: JoinSet::new(),
        };
        actor.run(cmd_rx, shutdown).await;
        Ok(())
    }
}

#[async_trait]
impl<S: MessageSender> MessageHandler for Gossiper<S> {
    async fn handle(&self, from: Signatory, msg: &Msg) -> Flow {
        if !matches!(msg.msg_type, MsgType::Push | MsgType::Pull | MsgType::Syn) {
            return Flow::Continue;
        }
        let cmd = Command::Inbound {
            from,
            msg: msg.clone(),
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            trace!("gossip actor closed, dropping message");
        }
        Flow::Stop
    }
}

// ============================================================================
// Actor
// ============================================================================

/// (target, digest)
type RumorKey = (Hash, Hash);

struct Rumor {
    pool: Vec<Signatory>,
    contacted: HashSet<Signatory>,
    in_flight: HashSet<Signatory>,
    attempts: u32,
    deadline: Instant,
}

impl Rumor {
    fn is_complete(&self) -> bool {
        self.in_flight.is_empty() && self.pool.iter().all(|p| self.contacted.contains(p))
    }
}

struct PendingPull {
    from: Signatory,
    requested: Instant,
}

struct SendOutcome {
    key: RumorKey,
    peer: Signatory,
    result: Result<()>,
}

struct GossipActor<S: MessageSender> {
    local: Signatory,
    config: GossipConfig,
    dht: Dht,
    sender: Arc<S>,
    rumors: LruCache<RumorKey, Rumor>,
    pulls: LruCache<Hash, PendingPull>,
    received_tx: mpsc::Sender<ReceivedContent>,
    num_rumors: Arc<AtomicUsize>,
    rng: StdRng,
    sends: JoinSet<SendOutcome>,
    replies: JoinSet<()>,
}

impl<S: MessageSender> GossipActor<S> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut retry = interval(self.config.timeout);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Gossip { target, digest }) => {
                        self.start_rumor(target, digest, None).await;
                    }
                    Some(Command::Inbound { from, msg }) => self.on_message(from, msg).await,
                    None => break,
                },
                Some(joined) = self.sends.join_next() => {
                    if let Ok(outcome) = joined {
                        self.on_send_outcome(outcome).await;
                    }
                }
                Some(_) = self.replies.join_next() => {}
                _ = retry.tick() => self.retry_round(),
            }
        }

        self.sends.shutdown().await;
        self.replies.shutdown().await;
        debug!(rumors = self.rumors.len(), "gossip actor stopped");
    }

    fn publish_len(&self) {
        self.num_rumors.store(self.rumors.len(), Ordering::Relaxed);
    }

    async fn pool_for(&self, target: Hash, origin: Option<Signatory>) -> Vec<Signatory> {
        let mut pool = if target == GLOBAL_SUBNET {
            self.dht.addresses(self.config.alpha).await
        } else {
            let members = self.dht.subnet(&target).await;
            if members.is_empty() {
                vec![Signatory::from_bytes(target)]
            } else {
                members
            }
        };
        pool.retain(|p| *p != self.local && Some(*p) != origin && p.is_valid());
        pool
    }

    async fn start_rumor(&mut self, target: Hash, digest: Hash, origin: Option<Signatory>) {
        let key = (target, digest);
        if self.rumors.contains(&key) {
            trace!(digest = %hex::encode(&digest[..8]), "rumor already live");
            return;
        }
        let pool = self.pool_for(target, origin).await;
        let rounds = self.config.max_attempts.max(1);
        let rumor = Rumor {
            pool,
            contacted: HashSet::new(),
            in_flight: HashSet::new(),
            attempts: 0,
            deadline: Instant::now() + self.config.timeout.saturating_mul(rounds),
        };
        trace!(
            target = %hex::encode(&target[..8]),
            digest = %hex::encode(&digest[..8]),
            pool = rumor.pool.len(),
            "starting rumor"
        );
        if let Some((evicted, _)) = self.rumors.push(key, rumor)
            && evicted != key
        {
            debug!(digest = %hex::encode(&evicted.1[..8]), "rumor evicted at capacity");
        }
        self.advance(key);
        self.finish_if_complete(key);
        self.publish_len();
    }

    /// Run one selection round for `key`.
    fn advance(&mut self, key: RumorKey) {
        let Some(rumor) = self.rumors.peek_mut(&key) else {
            return;
        };
        rumor.attempts += 1;
        let picked = select_peers(
            &rumor.pool,
            &rumor.contacted,
            &rumor.in_flight,
            self.config.alpha,
            self.config.bias,
            &mut self.rng,
        );
        for peer in picked {
            rumor.in_flight.insert(peer);
            let dht = self.dht.clone();
            let sender = self.sender.clone();
            let msg = Msg::new(MsgType::Push, key.0, key.1.to_vec());
            self.sends.spawn(async move {
                let addr = dht.peer_address(&peer).await.unwrap_or_default();
                let result = sender.send(peer, &addr, msg).await;
                SendOutcome { key, peer, result }
            });
        }
    }

    fn finish_if_complete(&mut self, key: RumorKey) {
        if self.rumors.peek(&key).is_some_and(Rumor::is_complete) {
            self.rumors.pop(&key);
            trace!(digest = %hex::encode(&key.1[..8]), "rumor complete");
        }
    }

    async fn on_send_outcome(&mut self, outcome: SendOutcome) {
        let SendOutcome { key, peer, result } = outcome;
        if let Err(e) = &result {
            debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "push failed, evicting peer");
            self.dht.delete_peer(peer).await;
        }

        if let Some(rumor) = self.rumors.peek_mut(&key) {
            rumor.in_flight.remove(&peer);
            if result.is_ok() {
                rumor.contacted.insert(peer);
                // Progressing rumors move away from the eviction end.
                self.rumors.promote(&key);
            } else {
                rumor.pool.retain(|p| *p != peer);
                rumor.contacted.remove(&peer);
            }
        }
        self.finish_if_complete(key);
        self.publish_len();
    }

    fn retry_round(&mut self) {
        let now = Instant::now();
        let keys: Vec<RumorKey> = self.rumors.iter().map(|(key, _)| *key).collect();
        for key in keys {
            let expired = self
                .rumors
                .peek(&key)
                .is_some_and(|r| r.attempts >= self.config.max_attempts || now >= r.deadline);
            if expired {
                self.rumors.pop(&key);
                debug!(digest = %hex::encode(&key.1[..8]), "rumor expired");
                continue;
            }
            self.advance(key);
            self.finish_if_complete(key);
        }

        let stale: Vec<Hash> = self
            .pulls
            .iter()
            .filter(|(_, pull)| now.duration_since(pull.requested) >= self.config.timeout)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in stale {
            self.pulls.pop(&digest);
        }
        self.publish_len();
    }

    /// Send a Pull or Syn without tying it to a rumor.
    fn reply(&mut self, to: Signatory, msg: Msg) {
        let dht = self.dht.clone();
        let sender = self.sender.clone();
        self.replies.spawn(async move {
            let addr = dht.peer_address(&to).await.unwrap_or_default();
            if let Err(e) = sender.send(to, &addr, msg).await {
                debug!(peer = %hex::encode(&to.as_bytes()[..8]), error = %e, "reply failed, evicting peer");
                dht.delete_peer(to).await;
            }
        });
    }

    async fn on_message(&mut self, from: Signatory, msg: Msg) {
        match msg.msg_type {
            MsgType::Push => self.on_push(from, &msg),
            MsgType::Pull => self.on_pull(from, &msg),
            MsgType::Syn => self.on_syn(from, &msg).await,
            MsgType::Ping | MsgType::PingAck => {}
        }
    }

    fn on_push(&mut self, from: Signatory, msg: &Msg) {
        let Some(digest) = msg.digest() else {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), "malformed push");
            return;
        };
        if self.dht.has_content(&digest) {
            return;
        }
        if let Some(pull) = self.pulls.peek(&digest)
            && pull.requested.elapsed() < self.config.timeout
        {
            trace!(digest = %hex::encode(&digest[..8]), "pull already in flight");
            return;
        }
        self.pulls.put(
            digest,
            PendingPull {
                from,
                requested: Instant::now(),
            },
        );
        self.reply(from, Msg::new(MsgType::Pull, msg.to, digest.to_vec()));
    }

    fn on_pull(&mut self, from: Signatory, msg: &Msg) {
        let Some(digest) = msg.digest() else {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), "malformed pull");
            return;
        };
        let Some(content) = self.dht.content(&digest) else {
            trace!(digest = %hex::encode(&digest[..8]), "pull for unknown content");
            return;
        };
        let body = SynBody {
            digest,
            content_type: content.content_type,
            content: content.data,
        };
        match serialize(&body) {
            Ok(data) => self.reply(from, Msg::new(MsgType::Syn, msg.to, data)),
            Err(e) => warn!(error = %e, "failed to encode syn"),
        }
    }

    async fn on_syn(&mut self, from: Signatory, msg: &Msg) {
        let body: SynBody = match deserialize_bounded(&msg.data) {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), error = %e, "malformed syn");
                return;
            }
        };
        match self.pulls.peek(&body.digest) {
            Some(pull) if pull.from == from => {}
            _ => {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), "dropping unsolicited syn");
                return;
            }
        }
        self.pulls.pop(&body.digest);

        if let Err(e) = self
            .dht
            .insert_content(body.digest, body.content_type, body.content.clone())
        {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), error = %e, "rejected syn content");
            return;
        }

        let received = ReceivedContent {
            from,
            target: msg.to,
            digest: body.digest,
            content_type: body.content_type,
            data: body.content,
        };
        match self.received_tx.try_send(received) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => warn!("content listener is full, dropping notification"),
        }

        if msg.to != self.local.hash() {
            self.start_rumor(msg.to, body.digest, Some(from)).await;
        }
    }
}

/// Pick up to `alpha` idle pool members.
///
/// Each slot prefers a member outside `contacted` with probability `bias`,
/// and otherwise draws uniformly from every member left.
fn select_peers<R: Rng>(
    pool: &[Signatory],
    contacted: &HashSet<Signatory>,
    busy: &HashSet<Signatory>,
    alpha: usize,
    bias: f64,
    rng: &mut R,
) -> Vec<Signatory> {
    let bias = clamp_probability(bias);
    let (mut fresh, mut seen): (Vec<Signatory>, Vec<Signatory>) = pool
        .iter()
        .filter(|p| !busy.contains(p))
        .partition(|p| !contacted.contains(p));

    let mut picked = Vec::with_capacity(alpha.min(pool.len()));
    while picked.len() < alpha && !(fresh.is_empty() && seen.is_empty()) {
        let take_fresh = if fresh.is_empty() {
            false
        } else if seen.is_empty() || rng.gen_bool(bias) {
            true
        } else {
            rng.gen_range(0..fresh.len() + seen.len()) < fresh.len()
        };
        let bucket = if take_fresh { &mut fresh } else { &mut seen };
        let i = rng.gen_range(0..bucket.len());
        picked.push(bucket.swap_remove(i));
    }
    picked
}
