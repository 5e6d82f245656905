//! Pipeline capability set consumed by the channel.
//!
//! The channel never assumes a dispatch mechanism. It only calls the
//! capabilities below, injected at construction.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Pipeline
// ============================================================================

/// Event sink a [`Channel`](super::Channel) publishes into.
///
/// Callbacks run on the channel's read or write task and must not block.
pub trait Pipeline: Send + Sync + 'static {
    /// Allocates a receive buffer with room for `capacity` bytes.
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }

    /// Delivers one filled receive buffer.
    ///
    /// # Errors
    ///
    /// An error is treated as a read fault: the channel fires
    /// [`fire_exception`](Self::fire_exception) and closes.
    fn fire_read(&self, buf: Bytes) -> Result<()>;

    /// Signals the end of a read cycle.
    fn fire_read_complete(&self);

    /// Reports a fault caught on the channel's read or write path.
    fn fire_exception(&self, error: Error);

    /// Signals that the channel reached `Closed` or `Aborted`.
    fn fire_inactive(&self) {}
}
