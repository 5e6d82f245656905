//! Byte-channel layer.
//!
//! Turns a physical duplex connection into a flow-controlled, event-driven
//! channel with no knowledge of protocol semantics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  fire_read / read_complete  ┌──────────────────┐
//! │   Pipeline   │◄────────────────────────────│                  │
//! │ (codec,      │  fire_exception / inactive  │     Channel      │
//! │  sessions)   │────────────────────────────►│  read loop       │
//! └──────────────┘   write / flush             │  write drain     │
//!                                              └────────┬─────────┘
//!                                                       │ DuplexStream
//!                                          ┌────────────┴───────────┐
//!                                          │ WebSocketDuplex │ TcpDuplex │
//!                                          └────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `alloc` | Receive-buffer sizing and continue-reading heuristic |
//! | `core` | The [`Channel`] itself |
//! | `pipeline` | Capability set the channel publishes into |
//! | `stream` | Duplex stream contract |
//! | `tcp` | Raw TCP stream |
//! | `websocket` | WebSocket stream |

// ============================================================================
// Submodules
// ============================================================================

/// Receive-buffer allocation policy.
pub mod alloc;

/// Channel lifecycle, read loop and write drain.
pub mod core;

/// Pipeline capability set.
pub mod pipeline;

/// Duplex stream contract.
pub mod stream;

/// Raw TCP duplex stream.
pub mod tcp;

/// WebSocket duplex stream.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::alloc::{AllocHandle, RecvBufferPolicy};
pub use self::core::{Channel, ChannelConfig, ChannelState};
pub use pipeline::Pipeline;
pub use stream::{CloseStatus, DuplexStream, FrameKind, Received, StreamState};
pub use tcp::TcpDuplex;
pub use websocket::WebSocketDuplex;
