//! Length-prefixed framing for reactor streams.
//!
//! Stream layout of one reactor message:
//!
//! ```text
//! [ body length: u32 LE ][ body ]
//! ```
//!
//! The body is a postcard-encoded [`Frame`]; the prefix counts body bytes only.

use std::io::ErrorKind;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Transport revision carried by [`Frame::Connect`].
pub const TRANSPORT_VERSION: u8 = 1;

/// Limits applied to every frame read or written.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Failure to move a frame across a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Body length above [`FrameConfig::max_payload_size`].
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Body length.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// The stream ended before a whole frame arrived.
    #[error("stream closed by peer")]
    ConnectionClosed,

    /// The frame body could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(#[from] postcard::Error),

    /// Socket failure.
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A reactor-level message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame sent by the connecting side.
    Connect {
        /// Must equal [`TRANSPORT_VERSION`].
        version: u8,
        /// Application data attached to the connection.
        data: u32,
    },
    /// Graceful disconnect carrying application data.
    Disconnect(u32),
    /// Application packet.
    Data {
        /// Logical channel.
        channel: u8,
        /// Raw delivery flags of the packet.
        flags: u8,
        /// Packet bytes.
        payload: Bytes,
    },
    /// Heartbeat carrying the sender's clock in milliseconds.
    Ping(u64),
    /// Echo of a [`Frame::Ping`] timestamp.
    Pong(u64),
}

impl Frame {
    /// Encode the frame body.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a frame body.
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        Ok(postcard::from_bytes(body)?)
    }
}

fn eof_as_closed(err: std::io::Error) -> FrameError {
    match err.kind() {
        ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
        _ => FrameError::Io(err),
    }
}

fn check_len(len: usize, config: &FrameConfig) -> Result<u32, FrameError> {
    match u32::try_from(len) {
        Ok(len) if len <= config.max_payload_size => Ok(len),
        _ => Err(FrameError::PayloadTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: config.max_payload_size,
        }),
    }
}

/// Read and decode one [`Frame`].
///
/// A peer closing the stream mid-frame yields
/// [`FrameError::ConnectionClosed`]. Not cancel-safe, so the reactor drives
/// it from a dedicated reader task.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let len = reader.read_u32_le().await.map_err(eof_as_closed)?;
    check_len(len as usize, config)?;

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(eof_as_closed)?;
    Frame::decode(&body)
}

/// Encode and write one [`Frame`], prefix and body in a single write.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let mut buf = postcard::to_extend(frame, vec![0u8; 4])?;
    let len = check_len(buf.len() - 4, config)?;
    buf[..4].copy_from_slice(&len.to_le_bytes());

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
