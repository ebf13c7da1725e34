//! # Connection Channel
//!
//! A per-peer logical message pipe that outlives any single physical
//! connection. Callers hold the outbound queue's sender and the inbound
//! queue's receiver; the channel moves messages between those queues and
//! whatever connection is currently attached.
//!
//! ## States
//!
//! ```text
//!                 attach                     attach (replace)
//!   Detached ───────────────► Attached ◄────────────────────┐
//!      ▲                        │  │                         │
//!      │   pump exit (I/O err)  │  └─────────────────────────┘
//!      └────────────────────────┘
//! ```
//!
//! - **Detached**: outbound messages wait in the queue; nothing is read.
//! - **Attached**: one writer pump drains the outbound queue into the
//!   connection and one reader pump feeds decoded messages to the inbound
//!   queue.
//!
//! ## Ordering
//!
//! The attachment slot is exclusive. `run` aborts and joins the previous pump
//! pair before spawning the next one, and each pair carries a generation
//! number that the reader checks before delivering.
//!
//! The writer holds the outbound receiver for as long as it runs and parks
//! the message it is writing in a one-slot `pending` buffer. The slot is
//! cleared only after the whole frame was written. A writer torn down
//! mid-frame therefore leaves the message for the next attachment, and a
//! message whose frame completed is never sent again. Messages that reached
//! a discarded connection but were not read yet are lost; nothing is
//! duplicated or reordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::codec::{FrameError, FrameReader, FrameWriter};
use crate::identity::Signatory;
use crate::messages::Msg;
use crate::protocols::shutdown_requested;

/// Inbound queue shared by channels: messages tagged with their sender.
pub type Inbound = mpsc::Sender<(Signatory, Msg)>;

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

enum ChannelCommand {
    Attach {
        generation: u64,
        writer: FrameWriter,
        reader: FrameReader,
    },
    Close,
}

struct Outbound {
    rx: mpsc::Receiver<Msg>,
    pending: Option<Msg>,
}

struct Shared {
    remote: Signatory,
    outbound: Mutex<Outbound>,
    inbound: Inbound,
    /// Highest generation handed to `attach`.
    requested: AtomicU64,
    /// Highest generation whose pumps have stopped.
    detached: AtomicU64,
    /// Generation of the pump pair currently allowed to deliver.
    active: AtomicU64,
}

impl Shared {
    fn mark_detached(&self, generation: u64) {
        self.detached.fetch_max(generation, Ordering::SeqCst);
        let _ = self
            .active
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

pub struct Channel {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<ChannelCommand>,
    cmd_rx: TakeOnce<ChannelCommand>,
}

impl Channel {
    pub fn new(remote: Signatory, inbound: Inbound, outbound: mpsc::Receiver<Msg>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        Self {
            shared: Arc::new(Shared {
                remote,
                outbound: Mutex::new(Outbound {
                    rx: outbound,
                    pending: None,
                }),
                inbound,
                requested: AtomicU64::new(0),
                detached: AtomicU64::new(0),
                active: AtomicU64::new(0),
            }),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }
    }

    pub fn remote(&self) -> Signatory {
        self.shared.remote
    }

    /// Number of attachments requested so far.
    pub fn generation(&self) -> u64 {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// True while the most recently requested attachment has not failed.
    pub fn is_attached(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst) > self.shared.detached.load(Ordering::SeqCst)
    }

    /// Bind a connection, replacing any current one.
    ///
    /// Takes effect once [`Channel::run`] picks it up; attachments made
    /// before `run` starts are applied in order when it does.
    pub async fn attach(&self, writer: FrameWriter, reader: FrameReader) -> Result<()> {
        let generation = self.shared.requested.fetch_add(1, Ordering::SeqCst) + 1;
        self.cmd_tx
            .send(ChannelCommand::Attach {
                generation,
                writer,
                reader,
            })
            .await
            .map_err(|_| anyhow!("channel closed"))
    }

    /// Stop `run`, dropping any attached connection.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Close).await;
    }

    /// Drive the channel until shutdown or [`Channel::close`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("channel is already running"))?;
        let mut pumps: Option<(u64, JoinSet<()>)> = None;
        let peer = hex::encode(&self.shared.remote.as_bytes()[..8]);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(ChannelCommand::Attach { generation, writer, reader }) => {
                        if let Some((previous, mut set)) = pumps.take() {
                            set.shutdown().await;
                            self.shared.mark_detached(previous);
                            trace!(peer = %peer, previous, generation, "replacing attached connection");
                        }
                        pumps = Some((generation, self.spawn_pumps(generation, writer, reader)));
                        debug!(peer = %peer, generation, "channel attached");
                    }
                    Some(ChannelCommand::Close) | None => break,
                },
                Some(_) = next_exit(&mut pumps) => {
                    if let Some((generation, mut set)) = pumps.take() {
                        set.shutdown().await;
                        self.shared.mark_detached(generation);
                        debug!(peer = %peer, generation, "channel detached");
                    }
                }
            }
        }

        if let Some((generation, mut set)) = pumps.take() {
            set.shutdown().await;
            self.shared.mark_detached(generation);
        }
        let requested = self.shared.requested.load(Ordering::SeqCst);
        self.shared.detached.fetch_max(requested, Ordering::SeqCst);
        trace!(peer = %peer, "channel stopped");
        Ok(())
    }

    fn spawn_pumps(&self, generation: u64, writer: FrameWriter, reader: FrameReader) -> JoinSet<()> {
        self.shared.active.store(generation, Ordering::SeqCst);
        let mut set = JoinSet::new();
        set.spawn(write_pump(self.shared.clone(), writer));
        set.spawn(read_pump(self.shared.clone(), generation, reader));
        set
    }
}

async fn next_exit(pumps: &mut Option<(u64, JoinSet<()>)>) -> Option<()> {
    match pumps {
        Some((_, set)) => set.join_next().await.map(|_| ()),
        None => std::future::pending().await,
    }
}

async fn write_pump(shared: Arc<Shared>, mut writer: FrameWriter) {
    let mut outbound = shared.outbound.lock().await;
    loop {
        if outbound.pending.is_none() {
            match outbound.rx.recv().await {
                Some(msg) => outbound.pending = Some(msg),
                None => return,
            }
        }
        let Some(msg) = outbound.pending.as_ref() else {
            continue;
        };
        match writer.send(msg).await {
            Ok(()) => {}
            Err(FrameError::Io(e)) => {
                trace!(
                    peer = %hex::encode(&shared.remote.as_bytes()[..8]),
                    error = %e,
                    "write failed, keeping message for next connection"
                );
                return;
            }
            Err(e) => {
                warn!(
                    peer = %hex::encode(&shared.remote.as_bytes()[..8]),
                    error = %e,
                    "dropping unsendable message"
                );
            }
        }
        outbound.pending = None;
    }
}

async fn read_pump(shared: Arc<Shared>, generation: u64, mut reader: FrameReader) {
    loop {
        match reader.recv().await {
            Ok(msg) => {
                if shared.active.load(Ordering::SeqCst) != generation {
                    return;
                }
                if shared.inbound.send((shared.remote, msg)).await.is_err() {
                    return;
                }
            }
            Err(e) if !e.is_fatal() => {
                debug!(
                    peer = %hex::encode(&shared.remote.as_bytes()[..8]),
                    error = %e,
                    "dropping malformed message"
                );
            }
            Err(e) => {
                trace!(
                    peer = %hex::encode(&shared.remote.as_bytes()[..8]),
                    error = %e,
                    "read failed"
                );
                return;
            }
        }
    }
}
