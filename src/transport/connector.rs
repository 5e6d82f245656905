//! Network connection factory.
//!
//! Dials the endpoint for a [`TransportSettings`] and wraps the resulting
//! stream in a [`FramedConnection`]:
//!
//! | Transport | Stream |
//! |-----------|--------|
//! | `AmqpWebSocket`, `MqttWebSocket` | [`WebSocketDuplex`] with the protocol's subprotocol |
//! | `AmqpTcp`, `MqttTcp` | [`TcpDuplex`] |
//!
//! No TLS stack is linked. Endpoints default to plain addressing; with
//! `secure` set, `wss` endpoints are rejected by the WebSocket client and
//! raw TCP is reported as unsupported, so secure endpoints need a
//! TLS-terminating local gateway.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::channel::{DuplexStream, TcpDuplex, WebSocketDuplex};
use crate::error::{Error, Result};

use super::framed::FramedConnection;
use super::identity::ConnectionIdentity;
use super::session::{ConnectionFactory, TransportConnection};
use super::settings::TransportSettings;

// ============================================================================
// NetworkConnector
// ============================================================================

/// [`ConnectionFactory`] that dials real endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkConnector;

impl NetworkConnector {
    /// Creates a connector.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn dial(settings: &TransportSettings, host: &str) -> Result<Box<dyn DuplexStream>> {
        let transport = settings.transport_type;
        if transport.is_websocket() {
            let url = settings.endpoint_url(host)?;
            let stream = WebSocketDuplex::connect(&url, transport.subprotocol()).await?;
            return Ok(Box::new(stream));
        }

        if settings.endpoint.secure {
            return Err(Error::unsupported("tls over raw tcp"));
        }
        let stream = TcpDuplex::connect((host, settings.port())).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl ConnectionFactory for NetworkConnector {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportConnection>> {
        let host = identity.host_name.as_str();
        let stream = Self::dial(settings, host).await?;
        let connection = FramedConnection::new(
            stream,
            settings.channel.clone(),
            settings.operation_timeout,
        )?;

        info!(
            connection_id = %connection.id(),
            transport = %settings.transport_type,
            host,
            "Connected"
        );
        Ok(Arc::new(connection))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::transport::{EndpointSettings, TransportType};

    async fn connect_err(settings: &TransportSettings) -> Error {
        let identity = ConnectionIdentity::new("127.0.0.1", "dev-1");
        match NetworkConnector::new().connect(&identity, settings).await {
            Ok(_) => panic!("connect unexpectedly succeeded"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_secure_raw_tcp_unsupported() {
        let settings = TransportSettings::new(TransportType::MqttTcp).with_endpoint(
            EndpointSettings {
                secure: true,
                port: None,
            },
        );
        let err = connect_err(&settings).await;
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_plain_tcp_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = TransportSettings::new(TransportType::AmqpTcp)
            .with_endpoint(EndpointSettings::insecure(port));
        let identity = ConnectionIdentity::new("127.0.0.1", "dev-1");
        let connector = NetworkConnector::new();

        let (connection, accepted) = tokio::join!(
            connector.connect(&identity, &settings),
            listener.accept()
        );
        let connection = connection.unwrap();
        let _server = accepted.unwrap();

        assert!(connection.is_healthy());
        connection.close().await;
        assert!(!connection.is_healthy());
    }

    #[tokio::test]
    async fn test_default_endpoint_dials_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settings = TransportSettings::new(TransportType::MqttTcp).with_endpoint(
            EndpointSettings {
                port: Some(port),
                ..EndpointSettings::default()
            },
        );
        let identity = ConnectionIdentity::new("127.0.0.1", "dev-1");
        let connector = NetworkConnector::new();

        let (connection, accepted) = tokio::join!(
            connector.connect(&identity, &settings),
            listener.accept()
        );
        let connection = connection.unwrap();
        let _server = accepted.unwrap();

        assert!(connection.is_healthy());
        connection.abort();
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = TransportSettings::new(TransportType::MqttTcp)
            .with_endpoint(EndpointSettings::insecure(port));
        let err = connect_err(&settings).await;
        assert!(err.is_connection_error());
    }
}
