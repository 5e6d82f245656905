//! Builder pattern for transport handlers.
//!
//! Provides a fluent API for configuring and creating [`TransportHandler`]
//! instances.
//!
//! # Example
//!
//! ```ignore
//! use device_transport::{PoolingSettings, TransportHandler, TransportSettings, TransportType};
//!
//! let settings = TransportSettings::new(TransportType::AmqpWebSocket)
//!     .with_pooling(PoolingSettings::enabled().with_max_pool_size(10));
//!
//! let handler = TransportHandler::builder()
//!     .connection_string("HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey=...")
//!     .settings(settings)
//!     .pool(Arc::clone(&pool))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::connector::NetworkConnector;
use super::handler::TransportHandler;
use super::identity::ConnectionIdentity;
use super::pool::ConnectionPool;
use super::session::ConnectionFactory;
use super::settings::TransportSettings;

// ============================================================================
// TransportHandlerBuilder
// ============================================================================

/// Builder for configuring a [`TransportHandler`].
///
/// Use [`TransportHandler::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct TransportHandlerBuilder {
    /// Explicit identity.
    identity: Option<ConnectionIdentity>,
    /// Connection string to parse when no identity is given.
    connection_string: Option<String>,
    /// Transport settings.
    settings: TransportSettings,
    /// Shared pool, required when pooling is enabled.
    pool: Option<Arc<ConnectionPool>>,
    /// Dialer for non-pooled connections.
    factory: Option<Arc<dyn ConnectionFactory>>,
}

impl fmt::Debug for TransportHandlerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandlerBuilder")
            .field("identity", &self.identity)
            .field("has_connection_string", &self.connection_string.is_some())
            .field("settings", &self.settings)
            .field("has_pool", &self.pool.is_some())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

// ============================================================================
// TransportHandlerBuilder Implementation
// ============================================================================

impl TransportHandlerBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection identity.
    #[inline]
    #[must_use]
    pub fn identity(mut self, identity: ConnectionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets a connection string to take the identity from.
    ///
    /// Ignored if [`identity`](Self::identity) is also set.
    #[inline]
    #[must_use]
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Sets the transport settings.
    #[inline]
    #[must_use]
    pub fn settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the pool to share connections through.
    #[inline]
    #[must_use]
    pub fn pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the dialer for non-pooled connections.
    ///
    /// Defaults to [`NetworkConnector`].
    #[inline]
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Builds the handler with validation.
    ///
    /// With pooling enabled, the pooling settings are registered with the
    /// pool's settings guard for this handler's key.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no identity or connection string is set
    /// - [`Error::Config`] if the connection string is malformed
    /// - [`Error::Config`] if the settings are invalid
    /// - [`Error::Config`] if pooling is enabled without a pool
    /// - [`Error::Config`] if the pooling settings differ from those first
    ///   registered for the same key
    pub fn build(self) -> Result<TransportHandler> {
        let identity = self.resolve_identity()?;
        self.settings.validate()?;

        if self.settings.pooling.enabled {
            let pool = self.pool.as_ref().ok_or_else(|| {
                Error::config(
                    "Pooling is enabled but no pool was supplied. Use .pool() to set it.",
                )
            })?;
            let key = identity.pool_key(self.settings.transport_type);
            pool.register(&key, &self.settings.pooling)?;
        }

        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(NetworkConnector::new()) as Arc<dyn ConnectionFactory>);

        Ok(TransportHandler::from_parts(
            identity,
            self.settings,
            self.pool,
            factory,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl TransportHandlerBuilder {
    /// Resolves the identity from the explicit value or connection string.
    fn resolve_identity(&self) -> Result<ConnectionIdentity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let connection_string = self.connection_string.as_deref().ok_or_else(|| {
            Error::config(
                "A connection identity is required. Use .identity() or .connection_string() to set it.",
            )
        })?;
        ConnectionIdentity::parse(connection_string)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::transport::{PoolingSettings, TransportType};

    fn pool() -> Arc<ConnectionPool> {
        ConnectionPool::new(Arc::new(NetworkConnector::new()))
    }

    #[test]
    fn test_build_fails_without_identity() {
        let err = TransportHandlerBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_from_connection_string() {
        let handler = TransportHandler::builder()
            .connection_string("HostName=hub;DeviceId=dev-1;SharedAccessKey=abc=")
            .build()
            .unwrap();
        assert_eq!(handler.identity().device_id, "dev-1");
        assert!(!handler.is_pooled());
    }

    #[test]
    fn test_build_rejects_bad_connection_string() {
        let result = TransportHandler::builder()
            .connection_string("DeviceId=dev-1")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_pooling_requires_pool() {
        let err = TransportHandler::builder()
            .identity(ConnectionIdentity::new("hub", "dev-1"))
            .settings(TransportSettings::default().with_pooling(PoolingSettings::enabled()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no pool was supplied"));
    }

    #[test]
    fn test_conflicting_pool_settings_rejected() {
        let pool = pool();
        let identity = ConnectionIdentity::new("hub", "dev-1");
        let settings = |max| {
            TransportSettings::new(TransportType::AmqpTcp).with_pooling(
                PoolingSettings::enabled()
                    .with_max_pool_size(max)
                    .with_idle_timeout(Duration::from_secs(60)),
            )
        };

        let first = TransportHandler::builder()
            .identity(identity.clone())
            .settings(settings(10))
            .pool(Arc::clone(&pool))
            .build()
            .unwrap();
        assert!(first.is_pooled());

        let err = TransportHandler::builder()
            .identity(identity.clone())
            .settings(settings(7))
            .pool(Arc::clone(&pool))
            .build()
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("cannot be modified from the initial settings")
        );

        let same = TransportHandler::builder()
            .identity(identity)
            .settings(settings(10))
            .pool(pool)
            .build();
        assert!(same.is_ok());
    }

    #[test]
    fn test_builder_is_clone() {
        let builder = TransportHandlerBuilder::new().connection_string("HostName=h;DeviceId=d");
        let cloned = builder.clone();
        assert!(cloned.build().is_ok());
        assert!(builder.build().is_ok());
    }
}
