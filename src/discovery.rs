//! # Peer Discovery
//!
//! Push-pull membership exchange. Every `ping_interval` the node pings up to
//! `alpha` random peers from its table:
//!
//! ```text
//!   A                                        B
//!   |--- Ping { max_expected_peers, addr } -->|   B verifies addr, AddPeer(A)
//!   |<-- PingAck [ (sig, addr), ... ] --------|   up to max_expected_peers entries
//!   AddPeer(each)
//! ```
//!
//! The ping carries A's self-signed address so B can dial A back even when
//! A only ever connected outbound. A failed ping send evicts the target
//! from the table immediately; there is no retry budget.
//!
//! Acks are sent from background tasks so a slow dial back to the pinger
//! never holds up inbound dispatch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace, warn};

use crate::dht::Dht;
use crate::identity::{Keypair, Signatory};
use crate::messages::{
    Msg, MsgType, PeerEntry, PingBody, decode_peer_entries, deserialize_bounded, encode_peer_entries,
    serialize,
};
use crate::protocols::{Flow, MessageHandler, MessageSender, shutdown_requested};

/// Default number of peers pinged per round.
pub const DEFAULT_ALPHA: usize = 3;

/// Peers requested per ping when the configured count is zero.
pub const DEFAULT_MAX_EXPECTED_PEERS: u64 = 5;

/// Default time between ping rounds.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default maximum age of a signed address accepted from a ping.
pub const DEFAULT_MAX_ADDRESS_AGE: Duration = Duration::from_secs(300);

/// Most entries returned in one PingAck.
/// SECURITY: A pinger cannot make us serialize the whole table.
pub const MAX_PEERS_PER_ACK: usize = 64;

/// Most PingAck sends in flight at once; further acks are dropped.
/// SECURITY: Bounds tasks created by a ping flood.
pub const MAX_PENDING_ACKS: usize = 256;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub alpha: usize,
    /// Entries requested from each pinged peer; 0 means the default.
    pub max_expected_peers: u64,
    pub ping_interval: Duration,
    pub max_address_age: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            max_expected_peers: DEFAULT_MAX_EXPECTED_PEERS,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_address_age: DEFAULT_MAX_ADDRESS_AGE,
        }
    }
}

impl DiscoveryConfig {
    fn expected_peers(&self) -> u64 {
        if self.max_expected_peers == 0 {
            DEFAULT_MAX_EXPECTED_PEERS
        } else {
            self.max_expected_peers
        }
    }
}

pub struct PeerDiscovery<S: MessageSender> {
    keypair: Keypair,
    advertised: String,
    config: DiscoveryConfig,
    dht: Dht,
    sender: Arc<S>,
    acks: std::sync::Mutex<JoinSet<()>>,
}

impl<S: MessageSender> PeerDiscovery<S> {
    pub fn new(
        keypair: Keypair,
        advertised: impl Into<String>,
        config: DiscoveryConfig,
        dht: Dht,
        sender: Arc<S>,
    ) -> Self {
        Self {
            keypair,
            advertised: advertised.into(),
            config,
            dht,
            sender,
            acks: std::sync::Mutex::new(JoinSet::new()),
        }
    }

    fn lock_acks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        let mut acks = self.acks.lock().unwrap_or_else(|p| p.into_inner());
        while acks.try_join_next().is_some() {}
        acks
    }

    /// Ping up to `alpha` peers. Returns how many pings were sent.
    pub async fn ping_round(&self) -> usize {
        let body = PingBody {
            max_expected_peers: self.config.expected_peers(),
            addr: self.keypair.sign_address(self.advertised.clone()),
        };
        let data = match serialize(&body) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode ping");
                return 0;
            }
        };

        let mut pings = JoinSet::new();
        for target in self.dht.addresses(self.config.alpha).await {
            let dht = self.dht.clone();
            let sender = self.sender.clone();
            let msg = Msg::new(MsgType::Ping, target.hash(), data.clone());
            pings.spawn(async move {
                let Some(addr) = dht.peer_address(&target).await else {
                    return false;
                };
                match sender.send(target, &addr, msg).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(
                            peer = %hex::encode(&target.as_bytes()[..8]),
                            error = %e,
                            "ping failed, evicting peer"
                        );
                        dht.delete_peer(target).await;
                        false
                    }
                }
            });
        }

        let mut sent = 0;
        while let Some(result) = pings.join_next().await {
            if matches!(result, Ok(true)) {
                sent += 1;
            }
        }
        sent
    }

    /// Ping every `ping_interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut round_shutdown = shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown_requested(&mut round_shutdown) => break,
                        sent = self.ping_round() => trace!(sent, "discovery round complete"),
                    }
                }
            }
        }

        let mut acks = std::mem::take(&mut *self.lock_acks());
        acks.shutdown().await;
        Ok(())
    }

    async fn on_ping(&self, from: Signatory, msg: &Msg) {
        let body: PingBody = match deserialize_bounded(&msg.data) {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), error = %e, "malformed ping");
                return;
            }
        };

        let reply_addr = match self.check_address(from, &body) {
            Ok(()) => {
                self.dht.add_peer(from, body.addr.addr.clone()).await;
                body.addr.addr
            }
            Err(reason) => {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), reason, "ignoring ping address");
                self.dht.peer_address(&from).await.unwrap_or_default()
            }
        };

        let wanted = usize::try_from(body.max_expected_peers)
            .unwrap_or(usize::MAX)
            .min(MAX_PEERS_PER_ACK);
        let records = self.dht.peers().await;
        let entries: Vec<PeerEntry> = records
            .into_iter()
            .filter(|record| record.signatory != from && !record.addr.is_empty())
            .map(|record| PeerEntry {
                signatory: record.signatory,
                addr: record.addr,
            })
            .choose_multiple(&mut rand::thread_rng(), wanted);

        let data = match encode_peer_entries(&entries) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode ping ack");
                return;
            }
        };
        let ack = Msg::new(MsgType::PingAck, from.hash(), data);
        let dht = self.dht.clone();
        let sender = self.sender.clone();
        let mut acks = self.lock_acks();
        if acks.len() >= MAX_PENDING_ACKS {
            debug!(peer = %hex::encode(&from.as_bytes()[..8]), "too many acks in flight, dropping");
            return;
        }
        acks.spawn(async move {
            if let Err(e) = sender.send(from, &reply_addr, ack).await {
                debug!(peer = %hex::encode(&from.as_bytes()[..8]), error = %e, "ping ack failed, evicting peer");
                dht.delete_peer(from).await;
            }
        });
    }

    fn check_address(&self, from: Signatory, body: &PingBody) -> Result<(), &'static str> {
        if body.addr.signatory != from {
            return Err("address signed by another signatory");
        }
        if body.addr.addr.is_empty() || body.addr.addr.len() > crate::messages::MAX_ADDRESS_LEN {
            return Err("address length out of range");
        }
        if body.addr.verify().is_err() {
            return Err("bad address signature");
        }
        let max_age_ms = u64::try_from(self.config.max_address_age.as_millis()).unwrap_or(u64::MAX);
        if body.addr.verify_fresh(max_age_ms).is_err() {
            return Err("address record is not fresh");
        }
        Ok(())
    }

    async fn on_ping_ack(&self, from: Signatory, msg: &Msg) {
        let (entries, err) = decode_peer_entries(&msg.data);
        if let Some(e) = err {
            debug!(
                peer = %hex::encode(&from.as_bytes()[..8]),
                kept = entries.len(),
                error = %e,
                "truncated ping ack"
            );
        }
        let local = self.keypair.signatory();
        let mut added = 0usize;
        for entry in entries {
            if entry.signatory == local || entry.addr.is_empty() || !entry.signatory.is_valid() {
                continue;
            }
            self.dht.add_peer(entry.signatory, entry.addr).await;
            added += 1;
        }
        trace!(peer = %hex::encode(&from.as_bytes()[..8]), added, "merged ping ack");
    }
}

#[async_trait]
impl<S: MessageSender> MessageHandler for PeerDiscovery<S> {
    async fn handle(&self, from: Signatory, msg: &Msg) -> Flow {
        match msg.msg_type {
            MsgType::Ping => self.on_ping(from, msg).await,
            MsgType::PingAck => self.on_ping_ack(from, msg).await,
            _ => return Flow::Continue,
        }
        Flow::Stop
    }
}
