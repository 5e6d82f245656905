//! Session-lifecycle layer.
//!
//! Wraps concrete protocol sessions with uniform cancellation, immutable
//! settings and connection pooling.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  acquire / release   ┌──────────────────┐
//! │ TransportHandler │─────────────────────►│  ConnectionPool  │
//! │  open / send /   │                      │  + SettingsGuard │
//! │  receive / settle│                      └────────┬─────────┘
//! └────────┬─────────┘                               │ ConnectionFactory
//!          │ ProtocolSession                         ▼
//!          │                          ┌───────────────────────────┐
//!          └─────────────────────────►│ TransportConnection       │
//!                                     │ (FramedConnection+Channel)│
//!                                     └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Handler builder |
//! | `connector` | Network connection factory |
//! | `framed` | Channel-backed connection and sessions |
//! | `guard` | Immutable pooling-settings guard |
//! | `handler` | Cancellable transport handler |
//! | `identity` | Connection identity and pooling key |
//! | `pool` | Keyed connection pool |
//! | `session` | Protocol seam traits |
//! | `settings` | Transport settings |

// ============================================================================
// Submodules
// ============================================================================

/// Builder for transport handlers.
pub mod builder;

/// Network connection factory.
pub mod connector;

/// Channel-backed connection.
pub mod framed;

/// Immutable settings guard.
pub mod guard;

/// Transport handler.
pub mod handler;

/// Identity and pooling key.
pub mod identity;

/// Connection pool.
pub mod pool;

/// Protocol seam traits.
pub mod session;

/// Transport settings.
pub mod settings;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::TransportHandlerBuilder;
pub use connector::NetworkConnector;
pub use framed::{FramedConnection, FramedSession};
pub use guard::SettingsGuard;
pub use handler::TransportHandler;
pub use identity::{ConnectionIdentity, PoolKey};
pub use pool::{ConnectionPool, PoolLease};
pub use session::{ConnectionFactory, ProtocolSession, TransportConnection};
pub use settings::{
    EndpointSettings, ExhaustionPolicy, PoolingSettings, TransportSettings, TransportType,
};
