//! Reference wire protocol.
//!
//! A small correlated request/response protocol carried over a
//! [`Channel`](crate::channel::Channel). It gives the transport handler a
//! concrete session implementation; AMQP and MQTT engines plug in through
//! the same session traits.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Length-prefixed frame encoding |
//! | `frame` | Frame and disposition types |
//! | `message` | Device message model |

// ============================================================================
// Submodules
// ============================================================================

/// Length-prefixed JSON codec.
pub mod codec;

/// Protocol frames.
pub mod frame;

/// Device messages.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{FrameCodec, MAX_FRAME_LEN};
pub use frame::{Disposition, Frame};
pub use message::Message;
