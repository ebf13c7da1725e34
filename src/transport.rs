//! # Transport Layer
//!
//! Owns one [`Channel`] per remote signatory and the TCP listener that feeds
//! them. Callers address peers by signatory; whether a socket currently
//! exists is hidden behind the channel.
//!
//! ## Connection Setup
//!
//! ```text
//!   send(to, addr, msg)                         accept loop
//!        │                                           │
//!        ▼                                           ▼
//!   peer_channel(to) ─ detached? ─ dial + handshake handshake
//!        │                          │                │
//!        │                          ▼                ▼
//!        │                    attach(writer, reader) ◄┘
//!        ▼
//!   outbound queue ──► writer pump ──► socket
//! ```
//!
//! ## Simultaneous Dials
//!
//! Two peers that dial each other at the same time end up with two
//! connections. A connection is *preferred* when its dialer has the smaller
//! signatory. Preferred connections always replace the current attachment;
//! the other kind is only attached to a detached channel. Both ends apply
//! the same rule, so they settle on the same socket.
//!
//! ## Resource Bounds
//!
//! | Resource | Bound |
//! |----------|-------|
//! | Channels | `max_channels` attached-at-least-once channels, least recently used is closed |
//! | Outbound queue per channel | `queue_capacity` messages |
//! | Dial | `dial_timeout` across all attempts and the handshake |
//! | Enqueue | `send_timeout` while the outbound queue is full |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, Inbound};
use crate::handshake::{Ed25519Handshake, Handshake};
use crate::identity::{Keypair, Signatory};
use crate::messages::Msg;
use crate::protocols::{MessageSender, shutdown_requested};
use crate::router::Router;

/// Default bound on connecting and authenticating a new peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default bound on waiting for room in a full outbound queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Default outbound queue depth per peer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default maximum number of live channels.
/// SECURITY: Bounds per-peer queues and pump tasks held at once.
pub const DEFAULT_MAX_CHANNELS: usize = 1024;

/// Depth of the inbound queue shared by all channels.
const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Pause after a failed `accept` so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Dial helpers
// ============================================================================

/// Retry schedule for outbound connection attempts.
#[derive(Clone, Debug)]
pub struct DialPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl DialPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `initial_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Open a TCP connection to `addr`, retrying per `policy`.
pub async fn dial(addr: &str, policy: &DialPolicy) -> Result<TcpStream> {
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                trace!(addr = %addr, attempt, error = %e, "dial attempt failed");
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }
    Err(anyhow!(
        "failed to connect to {addr} after {attempts} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub dial_timeout: Duration,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub queue_capacity: usize,
    pub max_channels: usize,
    pub dial_policy: DialPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            handshake_timeout: crate::handshake::DEFAULT_HANDSHAKE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_channels: DEFAULT_MAX_CHANNELS,
            dial_policy: DialPolicy::default(),
        }
    }
}

#[derive(Clone)]
struct PeerChannel {
    channel: Arc<Channel>,
    outbound: mpsc::Sender<Msg>,
    /// Serializes dials to one peer.
    dialing: Arc<Mutex<()>>,
}

struct TransportInner {
    local: Signatory,
    local_addr: SocketAddr,
    config: TransportConfig,
    handshake: Arc<dyn Handshake>,
    listener: std::sync::Mutex<Option<TcpListener>>,
    channels: std::sync::Mutex<LruCache<Signatory, PeerChannel>>,
    /// Channels whose first dial is still in flight.
    connecting: std::sync::Mutex<HashMap<Signatory, PeerChannel>>,
    inbound_tx: Inbound,
    inbound_rx: TakeOnce<(Signatory, Msg)>,
    spawn_tx: mpsc::UnboundedSender<Arc<Channel>>,
    spawn_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Channel>>>>,
}

/// Cheap-to-clone handle to the node's connections.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Bind the listener. Connections are accepted once [`Transport::run`] starts.
    pub async fn bind(keypair: Keypair, addr: &str, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr().context("failed to read bound address")?;
        let local = keypair.signatory();
        let handshake = Arc::new(Ed25519Handshake::new(keypair).with_timeout(config.handshake_timeout));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(config.max_channels).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            inner: Arc::new(TransportInner {
                local,
                local_addr,
                config,
                handshake,
                listener: std::sync::Mutex::new(Some(listener)),
                channels: std::sync::Mutex::new(LruCache::new(capacity)),
                connecting: std::sync::Mutex::new(HashMap::new()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                spawn_tx,
                spawn_rx: Mutex::new(Some(spawn_rx)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn signatory(&self) -> Signatory {
        self.inner.local
    }

    /// Whether a connection to `peer` is currently attached.
    pub fn is_connected(&self, peer: &Signatory) -> bool {
        self.inner
            .lock_channels()
            .peek(peer)
            .is_some_and(|p| p.channel.is_attached())
    }

    pub fn num_channels(&self) -> usize {
        self.inner.lock_channels().len()
    }

    /// Accept connections, run every channel and dispatch inbound messages
    /// through `router` until `shutdown` flips to true.
    ///
    /// All spawned work is joined before returning.
    pub async fn run(&self, router: Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow!("transport is already running"))?;
        let mut inbound = self
            .inner
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("transport is already running"))?;
        let mut spawned = self
            .inner
            .spawn_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("transport is already running"))?;

        let mut channels: JoinSet<Result<()>> = JoinSet::new();
        let mut handshakes: JoinSet<()> = JoinSet::new();
        info!(addr = %self.inner.local_addr, "transport listening");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let inner = self.inner.clone();
                        handshakes.spawn(async move {
                            if let Err(e) = inner.accept(stream).await {
                                debug!(addr = %addr, error = %e, "inbound connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(channel) = spawned.recv() => {
                    let shutdown = shutdown.clone();
                    channels.spawn(async move { channel.run(shutdown).await });
                }
                Some((from, msg)) = inbound.recv() => {
                    router.dispatch(from, &msg).await;
                }
                Some(_) = handshakes.join_next() => {}
                Some(result) = channels.join_next() => {
                    if let Ok(Err(e)) = result {
                        debug!(error = %e, "channel exited with error");
                    }
                }
            }
        }

        handshakes.shutdown().await;
        while channels.join_next().await.is_some() {}
        info!(addr = %self.inner.local_addr, "transport stopped");
        Ok(())
    }
}

#[async_trait]
impl MessageSender for Transport {
    async fn send(&self, to: Signatory, addr: &str, msg: Msg) -> Result<()> {
        if to == self.inner.local {
            bail!("refusing to send to self");
        }
        let peer = self.inner.peer_channel(to);
        if !peer.channel.is_attached() {
            if let Err(e) = self.inner.connect(&peer, to, addr).await {
                self.inner.abandon(&peer);
                return Err(e);
            }
            self.inner.register(&peer).await;
        }
        match timeout(self.inner.config.send_timeout, peer.outbound.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("channel to {to:?} is closed"),
            Err(_) => bail!("outbound queue to {to:?} stayed full"),
        }
    }
}

impl TransportInner {
    fn lock_channels(&self) -> std::sync::MutexGuard<'_, LruCache<Signatory, PeerChannel>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_connecting(&self) -> std::sync::MutexGuard<'_, HashMap<Signatory, PeerChannel>> {
        self.connecting.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The registered channel for `remote`, or the one being dialed.
    ///
    /// A new channel is only parked in `connecting`; it enters the LRU
    /// once a connection attaches, so unreachable peers never evict live
    /// channels.
    fn peer_channel(&self, remote: Signatory) -> PeerChannel {
        let mut channels = self.lock_channels();
        if let Some(peer) = channels.get(&remote) {
            return peer.clone();
        }
        self.lock_connecting()
            .entry(remote)
            .or_insert_with(|| {
                let (outbound, outbound_rx) = mpsc::channel(self.config.queue_capacity.max(1));
                PeerChannel {
                    channel: Arc::new(Channel::new(remote, self.inbound_tx.clone(), outbound_rx)),
                    outbound,
                    dialing: Arc::new(Mutex::new(())),
                }
            })
            .clone()
    }

    /// Drop an unregistered channel whose dial failed.
    fn abandon(&self, peer: &PeerChannel) {
        let remote = peer.channel.remote();
        let mut connecting = self.lock_connecting();
        if connecting
            .get(&remote)
            .is_some_and(|p| Arc::ptr_eq(&p.channel, &peer.channel))
            && !peer.channel.is_attached()
        {
            connecting.remove(&remote);
        }
    }

    /// Move an attached channel into the LRU and start it, closing
    /// whichever channel it displaces.
    async fn register(&self, peer: &PeerChannel) {
        let remote = peer.channel.remote();
        let displaced = {
            let mut channels = self.lock_channels();
            if channels
                .get(&remote)
                .is_some_and(|p| Arc::ptr_eq(&p.channel, &peer.channel))
            {
                return;
            }
            let mut connecting = self.lock_connecting();
            if connecting
                .get(&remote)
                .is_some_and(|p| Arc::ptr_eq(&p.channel, &peer.channel))
            {
                connecting.remove(&remote);
            }
            let displaced = channels.push(remote, peer.clone()).map(|(_, old)| old);
            let _ = self.spawn_tx.send(peer.channel.clone());
            displaced
        };

        if let Some(old) = displaced {
            debug!(
                peer = %hex::encode(&old.channel.remote().as_bytes()[..8]),
                "closing displaced channel"
            );
            old.channel.close().await;
        }
    }

    async fn connect(&self, peer: &PeerChannel, to: Signatory, addr: &str) -> Result<()> {
        let _dialing = peer.dialing.lock().await;
        if peer.channel.is_attached() {
            return Ok(());
        }
        if addr.is_empty() {
            bail!("no address known for {to:?}");
        }

        let (writer, reader, remote) = timeout(self.config.dial_timeout, async {
            let stream = dial(addr, &self.config.dial_policy).await?;
            self.handshake.handshake(Box::new(stream)).await
        })
        .await
        .map_err(|_| anyhow!("dial to {addr} timed out"))??;

        if remote != to {
            bail!("{addr} authenticated as {remote:?}, expected {to:?}");
        }

        let preferred = self.local < remote;
        if !preferred && peer.channel.is_attached() {
            trace!(peer = %hex::encode(&remote.as_bytes()[..8]), "keeping inbound connection over dialed one");
            return Ok(());
        }
        peer.channel.attach(writer, reader).await?;
        debug!(peer = %hex::encode(&remote.as_bytes()[..8]), addr = %addr, "outbound connection attached");
        Ok(())
    }

    async fn accept(&self, stream: TcpStream) -> Result<()> {
        let (writer, reader, remote) = self.handshake.handshake(Box::new(stream)).await?;
        let peer = self.peer_channel(remote);

        let preferred = remote < self.local;
        if !preferred && peer.channel.is_attached() {
            trace!(peer = %hex::encode(&remote.as_bytes()[..8]), "keeping dialed connection over inbound one");
            return Ok(());
        }
        peer.channel.attach(writer, reader).await?;
        self.register(&peer).await;
        debug!(peer = %hex::encode(&remote.as_bytes()[..8]), "inbound connection attached");
        Ok(())
    }
}
