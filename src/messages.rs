//! # Wire Protocol Messages
//!
//! Every frame on a connection carries one [`Msg`] envelope:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `version` | Envelope version, currently [`MSG_VERSION_1`] |
//! | `msg_type` | [`MsgType`] tag used for dispatch |
//! | `to` | Target hash: a subnet hash or a peer's signatory |
//! | `data` | Type-specific body bytes |
//!
//! ## Bodies
//!
//! | Type | Body |
//! |------|------|
//! | `Ping` | [`PingBody`]: requested peer count (u64 LE) + the pinger's [`SignedAddress`] |
//! | `PingAck` | Concatenated [`PeerEntry`] records |
//! | `Push` | 32-byte content digest |
//! | `Pull` | 32-byte content digest |
//! | `Syn` | [`SynBody`]: digest, type tag and payload |
//!
//! ## Security Limits
//!
//! - `MAX_CONTENT_SIZE`: Maximum size of a single content payload (1 MiB)
//! - `MAX_DESERIALIZE_SIZE`: Maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Hash, SignedAddress, Signatory};

/// The only envelope version currently spoken.
pub const MSG_VERSION_1: u16 = 1;

/// Maximum size of a single content payload (1 MiB).
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_CONTENT_SIZE to allow for envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_CONTENT_SIZE as u64) + 4096;

/// Maximum length of an advertised address string.
/// SECURITY: Bounds per-record allocation when decoding peer lists.
pub const MAX_ADDRESS_LEN: usize = 256;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// Discovery liveness check carrying a requested peer count.
    Ping,
    /// Discovery reply enumerating known peers.
    PingAck,
    /// Gossip digest announcement.
    Push,
    /// Gossip request for the content behind a digest.
    Pull,
    /// Gossip response carrying content.
    Syn,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    pub version: u16,
    pub msg_type: MsgType,
    pub to: Hash,
    pub data: Vec<u8>,
}

impl Msg {
    pub fn new(msg_type: MsgType, to: Hash, data: Vec<u8>) -> Self {
        Self {
            version: MSG_VERSION_1,
            msg_type,
            to,
            data,
        }
    }

    /// Read `data` as a 32-byte digest (Push and Pull bodies).
    pub fn digest(&self) -> Option<Hash> {
        self.data.as_slice().try_into().ok()
    }
}

// ============================================================================
// Bodies
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    /// How many peers the pinger would like listed in the ack.
    pub max_expected_peers: u64,
    pub addr: SignedAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynBody {
    pub digest: Hash,
    pub content_type: u8,
    pub content: Vec<u8>,
}

/// One (signatory, address) record in a PingAck.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub signatory: Signatory,
    pub addr: String,
}

/// Encode records back to back: 32-byte signatory, u64 LE length, address bytes.
pub fn encode_peer_entries(entries: &[PeerEntry]) -> Result<Vec<u8>, bincode::Error> {
    let mut out = Vec::with_capacity(entries.len() * (32 + 8 + 24));
    for entry in entries {
        bincode_options().serialize_into(&mut out, entry)?;
    }
    Ok(out)
}

/// Decode concatenated records.
///
/// Stops at the first malformed record and returns what was parsed before it,
/// together with the error that stopped decoding.
pub fn decode_peer_entries(mut bytes: &[u8]) -> (Vec<PeerEntry>, Option<bincode::Error>) {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        match bincode_options().deserialize_from::<_, PeerEntry>(&mut bytes) {
            Ok(entry) if entry.addr.len() <= MAX_ADDRESS_LEN => entries.push(entry),
            Ok(entry) => {
                let err = bincode::ErrorKind::Custom(format!(
                    "address of {} bytes exceeds limit",
                    entry.addr.len()
                ));
                return (entries, Some(Box::new(err)));
            }
            Err(e) => return (entries, Some(e)),
        }
    }
    (entries, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn entry(seed: u8, addr: &str) -> PeerEntry {
        PeerEntry {
            signatory: Signatory::from_bytes([seed; 32]),
            addr: addr.to_string(),
        }
    }

    #[test]
    fn envelope_survives_encoding() {
        let msg = Msg::new(MsgType::Push, [7u8; 32], vec![9u8; 32]);
        let bytes = serialize(&msg).unwrap();
        let decoded: Msg = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.version, MSG_VERSION_1);
        assert_eq!(decoded.digest(), Some([9u8; 32]));
    }

    #[test]
    fn digest_requires_exact_length() {
        let msg = Msg::new(MsgType::Pull, [0u8; 32], vec![1, 2, 3]);
        assert_eq!(msg.digest(), None);
    }

    #[test]
    fn ping_count_is_little_endian_prefix() {
        let kp = Keypair::generate();
        let body = PingBody {
            max_expected_peers: 5,
            addr: kp.sign_address("127.0.0.1:9000"),
        };
        let bytes = serialize(&body).unwrap();
        assert_eq!(&bytes[..8], &5u64.to_le_bytes());
        let decoded: PingBody = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn peer_entries_are_flat_records() {
        let entries = vec![entry(1, "127.0.0.1:1"), entry(2, "127.0.0.1:22")];
        let bytes = encode_peer_entries(&entries).unwrap();

        assert_eq!(bytes.len(), (32 + 8 + 11) + (32 + 8 + 12));
        assert_eq!(&bytes[..32], &[1u8; 32]);
        assert_eq!(&bytes[32..40], &11u64.to_le_bytes());

        let (decoded, err) = decode_peer_entries(&bytes);
        assert!(err.is_none());
        assert_eq!(decoded, entries);
    }

    #[test]
    fn peer_entry_decoding_keeps_prefix_on_garbage() {
        let entries = vec![entry(1, "127.0.0.1:1"), entry(2, "127.0.0.1:2")];
        let mut bytes = encode_peer_entries(&entries).unwrap();
        bytes.extend_from_slice(&[0xFF; 20]);

        let (decoded, err) = decode_peer_entries(&bytes);
        assert_eq!(decoded, entries);
        assert!(err.is_some());
    }

    #[test]
    fn peer_entry_decoding_rejects_huge_address() {
        let entries = vec![entry(1, &"x".repeat(MAX_ADDRESS_LEN + 1))];
        let bytes = encode_peer_entries(&entries).unwrap();
        let (decoded, err) = decode_peer_entries(&bytes);
        assert!(decoded.is_empty());
        assert!(err.is_some());
    }

    #[test]
    fn empty_ack_decodes_to_nothing() {
        let (decoded, err) = decode_peer_entries(&[]);
        assert!(decoded.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn bounded_deserialization_rejects_oversized_length() {
        // Vec length prefix claiming far more than the limit allows.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        bytes.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        let result: Result<Msg, _> = deserialize_bounded(&bytes);
        assert!(result.is_err());
    }
}
