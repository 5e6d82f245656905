//! Device Transport - protocol-agnostic device-to-cloud messaging plumbing.
//!
//! This library moves messages between a device and a cloud messaging
//! endpoint over interchangeable transports (AMQP or MQTT, over raw TCP or
//! tunnelled through WebSocket).
//!
//! # Architecture
//!
//! Two layers sit between the caller and the socket:
//!
//! - **Channel layer**: turns a duplex stream into a flow-controlled,
//!   event-driven [`Channel`] that publishes into a [`Pipeline`]
//! - **Session layer**: a [`TransportHandler`] offers open, send, receive
//!   and settle, each cancellable, over pooled or owned connections
//!
//! Key design principles:
//!
//! - At most one read loop and one write drain per channel
//! - Writes reach the peer in enqueue order
//! - Close never fails; a failed handshake becomes an abort
//! - A faulted connection is never handed out again
//! - Pooling settings are fixed per key once established
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use device_transport::{
//!     ConnectionPool, Message, NetworkConnector, PoolingSettings, Result, TransportHandler,
//!     TransportSettings, TransportType,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = ConnectionPool::new(Arc::new(NetworkConnector::new()));
//!     let settings = TransportSettings::new(TransportType::MqttWebSocket)
//!         .with_pooling(PoolingSettings::enabled().with_max_pool_size(10));
//!
//!     let handler = TransportHandler::builder()
//!         .connection_string("HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey=...")
//!         .settings(settings)
//!         .pool(pool)
//!         .build()?;
//!
//!     let cancel = CancellationToken::new();
//!     handler.open(&cancel).await?;
//!     handler.send_event(Message::new("21.5"), &cancel).await?;
//!
//!     if let Some(message) = handler.receive(Duration::from_secs(5), &cancel).await? {
//!         if let Some(tag) = &message.delivery_tag {
//!             handler.complete(tag, &cancel).await?;
//!         }
//!     }
//!
//!     handler.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`channel`] | Byte channel, pipeline contract and duplex streams |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Message model and reference frame codec |
//! | [`transport`] | Handler, pool, settings guard and connections |

// ============================================================================
// Modules
// ============================================================================

/// Byte-channel layer.
///
/// - [`Channel`] - Flow-controlled channel over one duplex stream
/// - [`Pipeline`] - Capability set the channel publishes into
/// - [`DuplexStream`] - Stream contract, with WebSocket and TCP adapters
pub mod channel;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Message model and reference wire protocol.
pub mod protocol;

/// Session-lifecycle layer.
///
/// Use [`TransportHandler::builder()`] to create a configured handler.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Channel types
pub use channel::{
    Channel, ChannelConfig, ChannelState, CloseStatus, DuplexStream, FrameKind, Pipeline,
    Received, RecvBufferPolicy, StreamState, TcpDuplex, WebSocketDuplex,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ChannelId, ConnectionId, DeliveryTag, RequestId};

// Protocol types
pub use protocol::{Disposition, Frame, FrameCodec, Message};

// Transport types
pub use transport::{
    ConnectionFactory, ConnectionIdentity, ConnectionPool, EndpointSettings, ExhaustionPolicy,
    FramedConnection, NetworkConnector, PoolKey, PoolLease, PoolingSettings, ProtocolSession,
    SettingsGuard, TransportConnection, TransportHandler, TransportHandlerBuilder,
    TransportSettings, TransportType,
};
