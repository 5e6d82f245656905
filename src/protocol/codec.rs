//! Length-prefixed JSON frame codec.
//!
//! Each frame on the wire is a 4-byte big-endian length followed by that
//! many bytes of JSON. The decoder buffers partial input across reads, so
//! a frame may arrive split over any number of `push` calls.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::Frame;

// ============================================================================
// Constants
// ============================================================================

/// Length prefix size in bytes.
const HEADER_LEN: usize = 4;

/// Largest accepted frame body (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ============================================================================
// FrameCodec
// ============================================================================

/// Stateful frame encoder and decoder.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    /// Creates an empty codec.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one frame with its length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails, or [`Error::Codec`]
    /// if the body exceeds [`MAX_FRAME_LEN`].
    pub fn encode(frame: &Frame) -> Result<Bytes> {
        let body = serde_json::to_vec(frame)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(Error::codec(format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
                body.len()
            )));
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        // Bounded by MAX_FRAME_LEN above.
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Appends received bytes to the decode buffer.
    #[inline]
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of buffered, undecoded bytes.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] for an oversized length prefix or a
    /// malformed body. The buffer is unusable after either error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(Error::codec(format!(
                "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let body = self.buffer.split_to(len);
        let frame = serde_json::from_slice(&body)
            .map_err(|e| Error::codec(format!("malformed frame body: {e}")))?;
        Ok(Some(frame))
    }
}

// ============================================================================
// Tests
// ============================================================================
