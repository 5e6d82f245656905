//! Protocol seams.
//!
//! Concrete protocols plug in through three traits:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`ConnectionFactory`] | Dials a physical connection |
//! | [`TransportConnection`] | One physical connection, shareable through the pool |
//! | [`ProtocolSession`] | One device's session on a connection |
//!
//! Implementations need not check caller cancellation; the handler races
//! every call against the caller's token and drops the future on cancel.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::identifiers::{ConnectionId, DeliveryTag};
use crate::protocol::{Disposition, Message};

use super::identity::ConnectionIdentity;
use super::settings::TransportSettings;

// ============================================================================
// ProtocolSession
// ============================================================================

/// One device's session on a [`TransportConnection`].
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Sends one message.
    async fn send(&self, message: Message) -> Result<()>;

    /// Sends messages as one unit: all are accepted or the call fails.
    async fn send_batch(&self, messages: Vec<Message>) -> Result<()>;

    /// Waits up to `timeout` for the next inbound message.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>>;

    /// Settles a previously received delivery.
    async fn settle(&self, tag: &DeliveryTag, disposition: Disposition) -> Result<()>;

    /// Ends the session. The connection stays up.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// TransportConnection
// ============================================================================

/// One physical connection carrying device sessions.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Returns the connection ID.
    fn id(&self) -> ConnectionId;

    /// Opens a session for `identity`.
    async fn open_session(&self, identity: &ConnectionIdentity) -> Result<Arc<dyn ProtocolSession>>;

    /// Returns `true` while the connection can carry new sessions.
    fn is_healthy(&self) -> bool;

    /// Closes gracefully; never fails.
    async fn close(&self);

    /// Tears down immediately.
    fn abort(&self);
}

// ============================================================================
// ConnectionFactory
// ============================================================================

/// Dials physical connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establishes a new connection for `identity` using `settings`.
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportConnection>>;
}
