//! # Signatures
//!
//! Domain-separated Ed25519 signing and verification.
//!
//! Every signed structure in driftnet gets its own domain prefix so that a
//! signature produced for one purpose can never be replayed as another:
//!
//! | Domain | Signed data |
//! |--------|-------------|
//! | [`ADDRESS_SIGNATURE_DOMAIN`] | [`SignedAddress`](crate::identity::SignedAddress) payloads |
//! | [`HANDSHAKE_SIGNATURE_DOMAIN`] | Handshake challenge responses |
//!
//! Only Ed25519 is accepted and verification uses `verify_strict`.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, Signatory};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for signed address records.
pub const ADDRESS_SIGNATURE_DOMAIN: &[u8] = b"driftnet-address-v1:";

/// Domain separation prefix for handshake challenge responses.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"driftnet-handshake-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `data` prefixed with `domain`.
///
/// Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
///
/// `signatory` is the claimed signer; `domain` must match the one used for signing.
pub fn verify_with_domain(
    signatory: &Signatory,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(signatory.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + data.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(data);
    out
}
