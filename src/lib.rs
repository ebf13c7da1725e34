//! # Driftnet - Peer-to-Peer Content Dissemination
//!
//! Driftnet moves typed content between nodes identified by Ed25519 keys,
//! either to one peer or across a named subnet, using digest-first gossip:
//!
//! - **Identity**: a node's signatory is its Ed25519 public key
//! - **Peer table**: bounded LRU of known peers, addresses and subnets
//! - **Content resolver**: two-tier cache keyed by BLAKE3 digest
//! - **Channels**: per-peer ordered pipes that survive reconnects
//! - **Discovery**: ping/ack exchange of peer lists
//! - **Gossip**: push digest, pull on demand, re-announce
//!
//! ## Architecture
//!
//! Shared state lives behind handles. The peer table is owned by a single
//! actor task; gossip runs as an actor fed by the inbound router; each
//! channel runs its own pump pair. Every long-running loop takes a
//! `watch::Receiver<bool>` and exits when it flips to true.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, signatories, digests, signed addresses |
//! | `crypto` | Domain-separated Ed25519 signatures |
//! | `messages` | Wire envelope, message bodies, bounded bincode |
//! | `codec` | Length-prefixed framing |
//! | `handshake` | Authenticating raw connections |
//! | `content` | Content resolver and the double cache |
//! | `dht` | Peer table actor |
//! | `protocols` | Sender and handler traits |
//! | `router` | Message-type dispatch with middleware |
//! | `channel` | Reconnect-tolerant per-peer channel |
//! | `transport` | TCP listener, dialing, one channel per peer |
//! | `discovery` | Ping/PingAck membership exchange |
//! | `gossip` | Push/Pull/Syn dissemination |

mod channel;
mod codec;
mod content;
mod crypto;
mod dht;
mod discovery;
mod gossip;
mod handshake;
mod identity;
mod messages;
mod node;
mod protocols;
mod router;
mod transport;

#[cfg(test)]
mod testutil;

pub use channel::Channel;
pub use codec::{FrameError, FrameReader, FrameWriter, framed};
pub use content::{Content, ContentError, ContentResolver, DoubleCacheConfig, DoubleCacheContentResolver};
pub use crypto::SignatureError;
pub use dht::{Dht, GLOBAL_SUBNET, PeerRecord, PeerTable, PeerTableConfig, subnet_hash};
pub use discovery::{DiscoveryConfig, PeerDiscovery};
pub use gossip::{GossipConfig, Gossiper, ReceivedContent};
pub use handshake::{BoxedConnection, Ed25519Handshake, Handshake};
pub use identity::{Hash, Keypair, Signatory, SignedAddress, digest};
pub use messages::{Msg, MsgType};
pub use node::{Node, NodeBuilder};
pub use protocols::{Flow, MessageHandler, MessageSender};
pub use router::{PeerTouch, Router, VersionFilter};
pub use transport::{DialPolicy, Transport, TransportConfig, dial};
