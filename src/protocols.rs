//! # Protocol Trait Definitions
//!
//! This module defines the seams between the protocol logic and the network:
//!
//! - [`MessageSender`]: delivers a [`Msg`] to a peer (implemented by the
//!   transport, and by in-memory networks in tests)
//! - [`MessageHandler`]: consumes an inbound [`Msg`]; handlers are chained by
//!   the [`Router`](crate::router::Router)
//!
//! Discovery and gossip are generic over [`MessageSender`], so their logic is
//! tested without sockets.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::identity::Signatory;
use crate::messages::Msg;

#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    /// Queue `msg` for `to`, connecting to `addr` if no connection exists.
    ///
    /// An error means the peer could not be reached within the configured
    /// timeout. `addr` may be empty when the peer is only known from an
    /// inbound connection.
    async fn send(&self, to: Signatory, addr: &str, msg: Msg) -> Result<()>;
}

/// Whether dispatch continues past a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, from: Signatory, msg: &Msg) -> Flow;
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
///
/// Returns `()` so no `watch::Ref` lives in a `select!` output.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}
