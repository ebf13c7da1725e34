//! # Identity and Content Addressing
//!
//! This module defines the identity and hashing primitives used throughout driftnet:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Signatory`]: 32-byte public key serving as the peer's unique identifier
//! - [`Hash`]: 32-byte BLAKE3 digest used for content, subnets and message targets
//! - [`SignedAddress`]: self-signed record binding a signatory to a dialable address
//!
//! ## Identity Model
//!
//! **Signatory = Ed25519 Public Key**. Possession of the private key proves
//! identity, so no external authority is needed. The same 32 bytes double as
//! the gossip target [`Hash`] of a direct send.
//!
//! ## Invariants
//!
//! - `Signatory::from_bytes(bytes).as_bytes() == bytes`
//! - `digest(p)` is deterministic: identical payloads always yield identical digests
//! - A [`SignedAddress`] only verifies under the key named by its own signatory

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{ADDRESS_SIGNATURE_DOMAIN, SignatureError};

/// A 32-byte content or target hash.
pub type Hash = [u8; 32];

/// Maximum accepted clock skew for signed address timestamps (ms).
const MAX_FUTURE_SKEW_MS: u64 = 60_000;

/// Compute the content digest of `data`.
#[inline]
pub fn digest(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Used for timestamp generation in signed records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn signatory(&self) -> Signatory {
        Signatory::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Create a signed record advertising `addr` as this keypair's endpoint.
    pub fn sign_address(&self, addr: impl Into<String>) -> SignedAddress {
        let signatory = self.signatory();
        let addr = addr.into();
        let timestamp = now_ms();
        let payload = SignedAddress::build_signed_payload(&signatory, &addr, timestamp);
        let signature = crate::crypto::sign_with_domain(self, ADDRESS_SIGNATURE_DOMAIN, &payload);

        SignedAddress {
            signatory,
            addr,
            timestamp,
            signature,
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("signatory", &hex::encode(self.signatory().as_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Signatory
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signatory([u8; 32]);

impl Signatory {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The gossip target hash addressing this peer directly.
    #[inline]
    pub fn hash(&self) -> Hash {
        self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that this signatory is a usable Ed25519 public key.
    ///
    /// Rejects the all-zero and all-0xFF patterns up front, then validates
    /// that the bytes decode to a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Signatory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signatory({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Signatory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Signatory {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Signatory> for [u8; 32] {
    fn from(signatory: Signatory) -> Self {
        signatory.0
    }
}

impl AsRef<[u8]> for Signatory {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Signed Address Records
// ============================================================================

/// A self-signed endpoint record.
///
/// Carried in discovery pings so the receiver can learn where to reach the
/// pinger. The signature binds `addr` and `timestamp` to `signatory`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAddress {
    pub signatory: Signatory,
    pub addr: String,
    /// Milliseconds since the Unix epoch at signing time.
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Error returned when a signed address is too old or from the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessError {
    Stale { age_ms: u64 },
    FutureTimestamp { skew_ms: u64 },
}

impl std::fmt::Display for FreshnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreshnessError::Stale { age_ms } => write!(f, "address record is stale ({age_ms}ms old)"),
            FreshnessError::FutureTimestamp { skew_ms } => {
                write!(f, "address record timestamp is {skew_ms}ms in the future")
            }
        }
    }
}

impl std::error::Error for FreshnessError {}

impl SignedAddress {
    pub fn build_signed_payload(signatory: &Signatory, addr: &str, timestamp: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 8 + 8 + addr.len());
        payload.extend_from_slice(signatory.as_bytes());
        payload.extend_from_slice(&timestamp.to_le_bytes());
        payload.extend_from_slice(&(addr.len() as u64).to_le_bytes());
        payload.extend_from_slice(addr.as_bytes());
        payload
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::build_signed_payload(&self.signatory, &self.addr, self.timestamp);
        crate::crypto::verify_with_domain(
            &self.signatory,
            ADDRESS_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    /// Check the timestamp is within `max_age_ms` of now.
    ///
    /// Does not check the signature; call [`SignedAddress::verify`] as well.
    pub fn verify_fresh(&self, max_age_ms: u64) -> Result<(), FreshnessError> {
        let now = now_ms();
        if self.timestamp > now {
            let skew_ms = self.timestamp - now;
            if skew_ms > MAX_FUTURE_SKEW_MS {
                return Err(FreshnessError::FutureTimestamp { skew_ms });
            }
            return Ok(());
        }
        let age_ms = now - self.timestamp;
        if age_ms > max_age_ms {
            return Err(FreshnessError::Stale { age_ms });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.signatory(), kp2.signatory());
        assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    }

    #[test]
    fn test_keypair_from_secret_is_deterministic() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.signatory(), restored.signatory());
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let message = b"hello world";

        let signature = kp.sign(message);
        assert!(kp.verify(message, &signature));

        assert!(!kp.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_signatory_hex_round_trip() {
        let sig = Keypair::generate().signatory();
        let hex = sig.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Signatory::from_hex(&hex).unwrap(), sig);
        assert!(Signatory::from_hex("abcd").is_err());
    }

    #[test]
    fn test_signatory_validity() {
        assert!(Keypair::generate().signatory().is_valid());
        assert!(!Signatory::from_bytes([0u8; 32]).is_valid());
        assert!(!Signatory::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn test_debug_is_truncated() {
        let sig = Signatory::from_bytes([0xAB; 32]);
        assert_eq!(format!("{sig:?}"), "Signatory(abababababababab)");
        assert_eq!(format!("{sig}").len(), 64);
    }

    #[test]
    fn test_digest_is_stable() {
        let payload = b"the same bytes".to_vec();
        assert_eq!(digest(&payload), digest(&payload.clone()));
        assert_ne!(digest(b"a"), digest(b"b"));
    }

    #[test]
    fn test_signed_address_verifies() {
        let kp = Keypair::generate();
        let record = kp.sign_address("127.0.0.1:4000");
        assert!(record.verify().is_ok());
        assert!(record.verify_fresh(60_000).is_ok());
    }

    #[test]
    fn test_signed_address_rejects_tampering() {
        let kp = Keypair::generate();
        let mut record = kp.sign_address("127.0.0.1:4000");
        record.addr = "10.0.0.1:4000".to_string();
        assert!(record.verify().is_err());

        let other = Keypair::generate();
        let mut stolen = kp.sign_address("127.0.0.1:4000");
        stolen.signatory = other.signatory();
        assert!(stolen.verify().is_err());
    }

    #[test]
    fn test_signed_address_freshness() {
        let kp = Keypair::generate();
        let mut record = kp.sign_address("127.0.0.1:4000");
        record.timestamp = now_ms().saturating_sub(120_000);
        assert!(matches!(
            record.verify_fresh(60_000),
            Err(FreshnessError::Stale { .. })
        ));

        record.timestamp = now_ms() + 10 * MAX_FUTURE_SKEW_MS;
        assert!(matches!(
            record.verify_fresh(60_000),
            Err(FreshnessError::FutureTimestamp { .. })
        ));
    }
}
