//! Duplex stream contract consumed by the channel.
//!
//! A [`DuplexStream`] is one physical connection offering message-oriented
//! send/receive, a close handshake and an abortive teardown. Methods take
//! `&self` so a read and a send may be in flight at the same time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

// ============================================================================
// StreamState
// ============================================================================

/// Connection state reported by the underlying stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Handshake not finished.
    Connecting,
    /// Connected, both directions usable.
    Open,
    /// Close handshake sent, waiting for the peer.
    CloseSent,
    /// Peer sent its close handshake.
    CloseReceived,
    /// Close handshake finished.
    Closed,
    /// Torn down without a handshake.
    Aborted,
}

impl StreamState {
    /// Returns `true` once the stream can no longer carry data.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

// ============================================================================
// FrameKind
// ============================================================================

/// Kind of frame a receive produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Binary data.
    Binary,
    /// UTF-8 text.
    Text,
}

// ============================================================================
// CloseStatus
// ============================================================================

/// Close handshake status code (RFC 6455 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseStatus(u16);

impl CloseStatus {
    /// Normal closure.
    pub const NORMAL: Self = Self(1000);
    /// Endpoint going away.
    pub const GOING_AWAY: Self = Self(1001);
    /// Peer violated the protocol.
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// Frame kind not accepted.
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    /// Unexpected local failure.
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Wraps a raw status code.
    #[inline]
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the raw status code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Received
// ============================================================================

/// Outcome of one receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Bytes appended to the caller's buffer.
    Data {
        /// Number of bytes appended (may be zero).
        count: usize,
        /// Kind of the frame the bytes belong to.
        kind: FrameKind,
        /// `true` if these were the last bytes of the frame.
        end_of_message: bool,
    },
    /// Peer closed the stream.
    Closed {
        /// Status sent by the peer, if any.
        status: Option<CloseStatus>,
        /// Reason sent by the peer.
        reason: String,
    },
}

// ============================================================================
// DuplexStream
// ============================================================================

/// One physical, message-oriented duplex connection.
#[async_trait]
pub trait DuplexStream: Send + Sync + 'static {
    /// Sends `data`; `end_of_message` marks the final fragment of a message.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`](crate::Error::Canceled) if `cancel` fires first
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) after abort
    async fn send(&self, data: Bytes, end_of_message: bool, cancel: &CancellationToken)
    -> Result<()>;

    /// Appends received bytes to `buf`, at most its spare capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`](crate::Error::Canceled) if `cancel` fires first
    /// - any transport error from the underlying socket
    async fn receive(&self, buf: &mut BytesMut, cancel: &CancellationToken) -> Result<Received>;

    /// Performs the close handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails; the caller falls back to
    /// [`abort`](Self::abort).
    async fn close(&self, status: CloseStatus, reason: &str, cancel: &CancellationToken)
    -> Result<()>;

    /// Tears the connection down immediately. Best effort, never fails.
    fn abort(&self);

    /// Returns the current connection state.
    fn state(&self) -> StreamState;
}

// ============================================================================
// Tests
// ============================================================================
