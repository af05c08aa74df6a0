//! Length-delimited frame codec
//!
//! Wire format: `[length: u32 big-endian][payload: bincode serialized Frame]`.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::Frame;
use crate::MAX_FRAME_SIZE;

const LENGTH_PREFIX: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(io::Error),

    /// The frame boundary was intact but the payload could not be decoded
    #[error("Malformed frame: {0}")]
    Malformed(bincode::Error),

    #[error("Serialization error: {0}")]
    Serialization(bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl CodecError {
    /// Peer went away; an expected end of session rather than a failure
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }

    /// The stream is still positioned on a frame boundary and may keep being read
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Malformed(_))
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => CodecError::Closed,
            _ => CodecError::Io(err),
        }
    }
}

/// Encode a frame to bytes
pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
    let payload = bincode::serialize(frame).map_err(CodecError::Serialization)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a frame from a buffer
///
/// Returns Ok(Some(frame)) if a complete frame was decoded,
/// Ok(None) if more data is needed.
/// A malformed payload is consumed from the buffer before the error is returned.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let mut length_bytes = [0u8; LENGTH_PREFIX];
    length_bytes.copy_from_slice(&buf[..LENGTH_PREFIX]);
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    let payload = buf.split_to(length);

    bincode::deserialize(&payload)
        .map(Some)
        .map_err(CodecError::Malformed)
}

/// Reads frames from the receiving half of a tunnel
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// Not cancel safe: dropping the future part-way loses the partially read frame.
    pub async fn read_frame(&mut self) -> Result<Frame, CodecError> {
        let length = self.inner.read_u32().await? as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        self.buf.clear();
        self.buf.resize(length, 0);
        self.inner.read_exact(&mut self.buf).await?;

        bincode::deserialize(&self.buf).map_err(CodecError::Malformed)
    }
}

/// Writes frames to the sending half of a tunnel
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let bytes = encode(frame)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write direction
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
