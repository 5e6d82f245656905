//! Error types for the device transport.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use device_transport::{Error, Result};
//!
//! async fn example(handler: &TransportHandler, cancel: &CancellationToken) -> Result<()> {
//!     handler.open(cancel).await?;
//!     handler.send_event(Message::new("hello"), cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Caller | [`Error::Canceled`], [`Error::NotOpen`], [`Error::Unsupported`] |
//! | Configuration | [`Error::Config`] |
//! | Channel | [`Error::ChannelInactive`], [`Error::ProtocolViolation`], [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Pool | [`Error::PoolExhausted`], [`Error::PoolClosed`] |
//! | Session | [`Error::NotFound`], [`Error::Remote`], [`Error::Timeout`], [`Error::Codec`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{ChannelId, DeliveryTag};
use crate::transport::PoolKey;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller Errors
    // ========================================================================
    /// Operation canceled by the caller.
    ///
    /// Returned when the caller's cancellation token fires before or
    /// during an operation.
    #[error("Operation canceled: {operation}")]
    Canceled {
        /// Name of the canceled operation.
        operation: &'static str,
    },

    /// Operation requires an open handler.
    #[error("Transport handler is not open")]
    NotOpen,

    /// Operation not supported by this channel shape.
    ///
    /// A client-initiated tunnel has no bind or disconnect phase.
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when settings are invalid or conflict with settings already
    /// established for the same pooling key.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// Channel is not active.
    ///
    /// Returned when reading or writing on a closing, closed or aborted channel.
    #[error("Channel {channel_id} is inactive")]
    ChannelInactive {
        /// The inactive channel.
        channel_id: ChannelId,
    },

    /// Peer violated the framing contract.
    ///
    /// Fatal to the channel and never retried.
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// Connection failed.
    ///
    /// Returned when a connection cannot be established or an I/O step fails.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Pool Errors
    // ========================================================================
    /// No pooled connection can accept another sharer.
    #[error("Connection pool exhausted for {key}: {max_pool_size} connections in use")]
    PoolExhausted {
        /// Pooling key that is at capacity.
        key: PoolKey,
        /// Configured maximum pool size.
        max_pool_size: usize,
    },

    /// Pool has been torn down.
    #[error("Connection pool is shut down")]
    PoolClosed,

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Delivery tag unknown or already settled.
    #[error("Delivery tag not found: {tag}")]
    NotFound {
        /// The unknown tag.
        tag: DeliveryTag,
    },

    /// Peer rejected a request.
    #[error("Remote error: {message}")]
    Remote {
        /// Error message reported by the peer.
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Frame could not be encoded or decoded.
    #[error("Codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Endpoint URL error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a canceled-operation error.
    #[inline]
    pub fn canceled(operation: &'static str) -> Self {
        Self::Canceled { operation }
    }

    /// Creates an unsupported-operation error.
    #[inline]
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates the error returned when pooling settings differ from the
    /// settings first registered for the same key.
    #[inline]
    pub fn settings_modified(setting: &str, initial: impl std::fmt::Display) -> Self {
        Self::config(format!(
            "{setting} cannot be modified from the initial settings (initial value: {initial})"
        ))
    }

    /// Creates a channel-inactive error.
    #[inline]
    pub fn channel_inactive(channel_id: ChannelId) -> Self {
        Self::ChannelInactive { channel_id }
    }

    /// Creates a protocol-violation error.
    #[inline]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a pool-exhausted error.
    #[inline]
    pub fn pool_exhausted(key: PoolKey, max_pool_size: usize) -> Self {
        Self::PoolExhausted { key, max_pool_size }
    }

    /// Creates a not-found error for a delivery tag.
    #[inline]
    pub fn not_found(tag: DeliveryTag) -> Self {
        Self::NotFound { tag }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a codec error.
    #[inline]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the operation was canceled by the caller.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns `true` if the peer spoke the wrong protocol.
    #[inline]
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. } | Self::Codec { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ChannelInactive { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the underlying channel must be discarded.
    ///
    /// A faulted channel is never resurrected or returned to the pool.
    #[inline]
    #[must_use]
    pub fn is_fatal_to_channel(&self) -> bool {
        self.is_protocol_violation() || self.is_connection_error()
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when the session-level operation is
    /// retried against a fresh connection. Cancellation, configuration
    /// conflicts and protocol violations are never recoverable.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ChannelInactive { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
