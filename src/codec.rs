//! # Frame Codec
//!
//! Length-prefixed framing of [`Msg`] envelopes over any byte stream:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | bincode(Msg), len bytes   |
//! +----------------+---------------------------+
//! ```
//!
//! A frame that is well delimited but does not decode is *malformed*: it is
//! dropped and the stream stays usable. An I/O failure or an oversize length
//! prefix means the framing itself can no longer be trusted, so the
//! connection must be torn down. [`FrameError::is_fatal`] makes that call.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::{self, Msg};

/// Maximum size of a single frame body.
/// SECURITY: Bounds the allocation made from an untrusted length prefix.
pub const MAX_FRAME_SIZE: usize = messages::MAX_DESERIALIZE_SIZE as usize;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
pub enum FrameError {
    /// The underlying stream failed or closed.
    Io(io::Error),
    /// The length prefix exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// The frame body did not decode.
    Malformed(bincode::Error),
}

impl FrameError {
    /// Whether the stream must be abandoned after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Malformed(_))
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "frame i/o failed: {e}"),
            FrameError::TooLarge(len) => {
                write!(f, "frame too large: {len} bytes (max {MAX_FRAME_SIZE})")
            }
            FrameError::Malformed(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Encoding half of a connection.
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(inner: BoxedWriter) -> Self {
        Self { inner }
    }

    /// Write one raw frame and flush it.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), FrameError> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(body.len()));
        }
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, msg: &Msg) -> Result<(), FrameError> {
        let body = messages::serialize(msg).map_err(FrameError::Malformed)?;
        self.write_frame(&body).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Decoding half of a connection.
pub struct FrameReader {
    inner: BoxedReader,
}

impl FrameReader {
    pub fn new(inner: BoxedReader) -> Self {
        Self { inner }
    }

    /// Read one raw frame.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(body)
    }

    pub async fn recv(&mut self) -> Result<Msg, FrameError> {
        let body = self.read_frame().await?;
        messages::deserialize_bounded(&body).map_err(FrameError::Malformed)
    }
}

/// Wrap the two halves of a stream into a frame writer/reader pair.
pub fn framed<S>(stream: S) -> (FrameWriter, FrameReader)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FrameWriter::new(Box::new(write_half)),
        FrameReader::new(Box::new(read_half)),
    )
}
