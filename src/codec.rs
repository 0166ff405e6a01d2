//! Length-prefixed frame codec.
//!
//! Every frame on the wire is a 4-byte big-endian payload length followed by
//! exactly that many payload bytes:
//!
//! ```text
//! +----------------+------------------------+
//! | length (u32BE) | payload (length bytes) |
//! +----------------+------------------------+
//! ```
//!
//! The codec is shared by the server's connection handlers and the client.
//! It keeps no state of its own beyond the configured maximum frame size;
//! decoding only consumes bytes from the buffer it is handed once a complete
//! frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest up-front reservation for an incomplete frame. Bigger frames grow
/// the buffer as their bytes arrive.
const MAX_RESERVE: usize = 64 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Outbound payload exceeds the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// Inbound length prefix declares more than the configured maximum.
    InvalidFrame { declared: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::FrameTooLarge { len, max } => {
                write!(f, "frame too large: {len} bytes exceeds maximum of {max}")
            }
            FrameError::InvalidFrame { declared, max } => {
                write!(
                    f,
                    "invalid frame: declared length {declared} exceeds maximum of {max}"
                )
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Frame encoder/decoder bound to a maximum payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec accepting payloads up to `max_frame_size` bytes.
    ///
    /// The limit is clamped to `u32::MAX`, the largest length the prefix can
    /// carry.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode `payload` into a standalone frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append the frame for `payload` to `dst`.
    ///
    /// Nothing is written when the payload is rejected.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);
        Ok(())
    }

    /// Try to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when the header or the
    /// payload is still incomplete. On success the frame's bytes are split
    /// off `src`, leaving any remainder in place.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some(declared) = peek_len(src) else {
            return Ok(None);
        };

        if declared > self.max_frame_size {
            return Err(FrameError::InvalidFrame {
                declared,
                max: self.max_frame_size,
            });
        }

        if src.len() < HEADER_LEN + declared {
            // Bounded so a bare header cannot claim a full frame's memory
            src.reserve((HEADER_LEN + declared - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Read the declared payload length without consuming it.
fn peek_len(src: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = src.get(..HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}
