//! Length-prefixed bincode frames.
//!
//! Frame layout: magic (u32 BE) + payload length (u32 BE) + bincode payload.
//! Shared by the topo server protocol and the agent RPC port.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic number.
pub const MAGIC: u32 = 0x7AB1_E701;
/// Header size: magic + length.
pub const HEADER_SIZE: usize = 8;
/// Largest accepted payload.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Header magic did not match.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic.
        expected: u32,
        /// Received magic.
        got: u32,
    },

    /// Payload length over `MAX_FRAME_SIZE`.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced size.
        size: u32,
        /// Limit.
        max_size: u32,
    },

    /// bincode failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encodes and writes one message.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(|e| WireError::Serialization(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge {
        size: u32::MAX,
        max_size: MAX_FRAME_SIZE,
    })?;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: len,
            max_size: MAX_FRAME_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one message. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(r: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_SIZE];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(WireError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::PayloadTooLarge {
            size: len,
            max_size: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| WireError::Serialization(e.to_string()))
}
