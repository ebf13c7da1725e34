//! # Connection Handshake
//!
//! Turns a raw byte stream into an authenticated frame writer/reader pair and
//! the verified [`Signatory`] of the remote end.
//!
//! ## Ed25519 Challenge-Response
//!
//! ```text
//!   A                                   B
//!   |--- Hello { signatory_a, nonce_a } -->|
//!   |<-- Hello { signatory_b, nonce_b } ---|
//!   |--- Proof { sig_a(nonce_b || a) } --->|
//!   |<-- Proof { sig_b(nonce_a || b) } ----|
//! ```
//!
//! Both sides run the same script, so it does not matter who dialed. Each
//! proof is signed under [`HANDSHAKE_SIGNATURE_DOMAIN`] and checked against
//! the key the peer claimed in its hello. Callers trust the returned
//! signatory completely.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{FrameReader, FrameWriter, framed};
use crate::crypto::{HANDSHAKE_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::identity::{Keypair, Signatory};
use crate::messages::{deserialize_bounded, serialize};

/// Default upper bound on a complete handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A raw bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

/// Authenticated Connection Provider.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Authenticate `conn`, returning the encoder, decoder and remote signatory.
    async fn handshake(&self, conn: BoxedConnection) -> Result<(FrameWriter, FrameReader, Signatory)>;
}

#[derive(Serialize, Deserialize)]
struct Hello {
    signatory: Signatory,
    nonce: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct Proof {
    signature: Vec<u8>,
}

fn challenge(nonce: &[u8; 32], signer: &Signatory) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(nonce);
    out.extend_from_slice(signer.as_bytes());
    out
}

pub struct Ed25519Handshake {
    keypair: Keypair,
    timeout: Duration,
}

impl Ed25519Handshake {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(
        &self,
        writer: &mut FrameWriter,
        reader: &mut FrameReader,
    ) -> Result<Signatory> {
        let local = self.keypair.signatory();
        let nonce: [u8; 32] = rand::random();

        writer
            .write_frame(&serialize(&Hello { signatory: local, nonce })?)
            .await
            .context("failed to send hello")?;
        let hello: Hello = deserialize_bounded(&reader.read_frame().await.context("failed to read hello")?)
            .context("malformed hello")?;

        if !hello.signatory.is_valid() {
            bail!("remote signatory is not a valid public key");
        }
        if hello.signatory == local {
            bail!("refusing to handshake with own signatory");
        }

        let signature = sign_with_domain(
            &self.keypair,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &challenge(&hello.nonce, &local),
        );
        writer
            .write_frame(&serialize(&Proof { signature })?)
            .await
            .context("failed to send proof")?;
        let proof: Proof = deserialize_bounded(&reader.read_frame().await.context("failed to read proof")?)
            .context("malformed proof")?;

        verify_with_domain(
            &hello.signatory,
            HANDSHAKE_SIGNATURE_DOMAIN,
            &challenge(&nonce, &hello.signatory),
            &proof.signature,
        )
        .context("remote failed to prove its signatory")?;

        Ok(hello.signatory)
    }
}

#[async_trait]
impl Handshake for Ed25519Handshake {
    async fn handshake(&self, conn: BoxedConnection) -> Result<(FrameWriter, FrameReader, Signatory)> {
        let (mut writer, mut reader) = framed(conn);
        let remote = tokio::time::timeout(self.timeout, self.exchange(&mut writer, &mut reader))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out"))??;
        Ok((writer, reader, remote))
    }
}
