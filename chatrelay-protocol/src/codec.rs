//! Length-prefixed framing for application messages
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 JSON. Decoding is resumable: a partial frame stays in the
//! read buffer until the rest of it arrives.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::ApplicationMessage;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Stream ended inside a frame ({remaining} bytes left over)")]
    TruncatedFrame { remaining: usize },
}

impl CodecError {
    /// True when the peer sent bytes that cannot be decoded, as opposed to
    /// the transport itself failing
    pub fn is_framing(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Codec for [`ApplicationMessage`] in both directions
///
/// The relay and its clients speak the same frame format, so one codec serves
/// both ends of a connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec that rejects payloads larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = ApplicationMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the whole length prefix first
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at length without consuming
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_PREFIX_SIZE + len {
            // Reserve space for the rest of the frame
            src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let data = src.split_to(len);

        let text = std::str::from_utf8(&data)?;
        let msg = serde_json::from_str(text)?;
        Ok(Some(msg))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::TruncatedFrame {
                remaining: src.len(),
            }),
        }
    }
}

impl Encoder<ApplicationMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ApplicationMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)?;

        if data.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}
