//! Frame format for protocol messages.
//!
//! Each frame is a varint message code, a u32 little-endian payload
//! length, then the payload bytes. Frames above [`MAX_MSG_SIZE`] are
//! rejected before the payload is read.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use apiary_core::wire::{put_uvarint, WireError};

use crate::messages::MsgCode;
use crate::MAX_MSG_SIZE;

/// Frame parsing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload length exceeds the protocol maximum
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Declared payload size
        size: usize,
        /// Protocol maximum
        limit: usize,
    },

    /// Message code outside the protocol range
    #[error("invalid message code {0}")]
    InvalidCode(u64),

    /// Malformed frame header
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A single protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message code
    pub code: MsgCode,
    /// Encoded message payload
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame from a code and payload.
    pub fn new(code: MsgCode, payload: Bytes) -> Self {
        Self { code, payload }
    }

    /// Encodes the frame, header and payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 10);
        put_uvarint(&mut buf, self.code.tag());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Tries to parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes
    /// are only removed from `buf` once a whole frame is available or
    /// the header is known to be invalid.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // varint code
        let mut tag = 0u64;
        let mut shift = 0u32;
        let mut header = 0usize;
        loop {
            let Some(&byte) = buf.get(header) else {
                return Ok(None);
            };
            header += 1;
            if shift == 63 && byte > 1 {
                return Err(FrameError::Wire(WireError::VarintOverflow));
            }
            tag |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(FrameError::Wire(WireError::VarintOverflow));
            }
        }
        let code = MsgCode::from_tag(tag).map_err(|_| FrameError::InvalidCode(tag))?;

        if buf.len() < header + 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes([
            buf[header],
            buf[header + 1],
            buf[header + 2],
            buf[header + 3],
        ]) as usize;
        if size > MAX_MSG_SIZE {
            return Err(FrameError::TooLarge {
                size,
                limit: MAX_MSG_SIZE,
            });
        }
        if buf.len() < header + 4 + size {
            return Ok(None);
        }

        buf.advance(header + 4);
        let payload = buf.split_to(size).freeze();
        Ok(Some(Frame { code, payload }))
    }
}
