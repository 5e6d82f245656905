//! Transport settings.
//!
//! Settings are plain data with builder-style `with_*` methods and serde
//! support, so they can be constructed in code or loaded from JSON.
//! Durations are expressed in milliseconds on the wire.
//!
//! # Example
//!
//! ```ignore
//! let settings = TransportSettings::new(TransportType::MqttWebSocket)
//!     .with_operation_timeout(Duration::from_secs(60))
//!     .with_pooling(PoolingSettings::enabled().with_max_pool_size(10));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::channel::ChannelConfig;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Default maximum number of pooled connections per key.
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;

/// Default maximum number of handlers sharing one pooled connection.
pub const DEFAULT_MAX_SHARERS_PER_ENTRY: usize = 995;

/// Default idle time before an unreferenced pooled connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Path of the WebSocket tunnel on the service endpoint.
const WEBSOCKET_PATH: &str = "/$iothub/websocket";

// ============================================================================
// Duration Serialization
// ============================================================================

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// TransportType
// ============================================================================

/// Wire protocol and carrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// AMQP over TLS/TCP.
    #[default]
    AmqpTcp,
    /// AMQP tunnelled through WebSocket.
    AmqpWebSocket,
    /// MQTT over TLS/TCP.
    MqttTcp,
    /// MQTT tunnelled through WebSocket.
    MqttWebSocket,
}

impl TransportType {
    /// Returns `true` for WebSocket-tunnelled transports.
    #[inline]
    #[must_use]
    pub const fn is_websocket(self) -> bool {
        matches!(self, Self::AmqpWebSocket | Self::MqttWebSocket)
    }

    /// Returns `true` for AMQP transports.
    #[inline]
    #[must_use]
    pub const fn is_amqp(self) -> bool {
        matches!(self, Self::AmqpTcp | Self::AmqpWebSocket)
    }

    /// Returns the default port for this transport.
    #[must_use]
    pub const fn default_port(self, secure: bool) -> u16 {
        match (self, secure) {
            (Self::AmqpWebSocket | Self::MqttWebSocket, true) => 443,
            (Self::AmqpWebSocket | Self::MqttWebSocket, false) => 80,
            (Self::AmqpTcp, true) => 5671,
            (Self::AmqpTcp, false) => 5672,
            (Self::MqttTcp, true) => 8883,
            (Self::MqttTcp, false) => 1883,
        }
    }

    /// Returns the WebSocket subprotocol name.
    #[inline]
    #[must_use]
    pub const fn subprotocol(self) -> &'static str {
        if self.is_amqp() { "AMQPWSB10" } else { "mqtt" }
    }

    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AmqpTcp => "amqp_tcp",
            Self::AmqpWebSocket => "amqp_web_socket",
            Self::MqttTcp => "mqtt_tcp",
            Self::MqttWebSocket => "mqtt_web_socket",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ExhaustionPolicy
// ============================================================================

/// Behavior of `acquire` when every pooled connection is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail immediately with [`Error::PoolExhausted`].
    #[default]
    Fail,
    /// Wait up to `timeout` for capacity, then fail.
    Wait {
        /// Longest wait for a free slot.
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
}

impl fmt::Display for ExhaustionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Wait { timeout } => write!(f, "wait({}ms)", timeout.as_millis()),
        }
    }
}

// ============================================================================
// PoolingSettings
// ============================================================================

/// Connection pooling settings.
///
/// These are the pooling-relevant settings: once registered for a pool
/// key, later handlers for that key must supply identical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingSettings {
    /// Whether connections are pooled.
    pub enabled: bool,
    /// Maximum connections per key.
    pub max_pool_size: usize,
    /// Maximum handlers sharing one connection.
    pub max_sharers_per_entry: usize,
    /// Idle time before an unreferenced connection is closed.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Behavior when at capacity.
    pub exhaustion: ExhaustionPolicy,
}

impl Default for PoolingSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolingSettings {
    /// Creates disabled pooling settings with default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: false,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_sharers_per_entry: DEFAULT_MAX_SHARERS_PER_ENTRY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            exhaustion: ExhaustionPolicy::Fail,
        }
    }

    /// Creates enabled pooling settings with default limits.
    #[must_use]
    pub const fn enabled() -> Self {
        let mut settings = Self::new();
        settings.enabled = true;
        settings
    }

    /// Sets the maximum pool size.
    #[inline]
    #[must_use]
    pub const fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Sets the per-connection sharer limit.
    #[inline]
    #[must_use]
    pub const fn with_max_sharers_per_entry(mut self, max: usize) -> Self {
        self.max_sharers_per_entry = max;
        self
    }

    /// Sets the idle timeout.
    #[inline]
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the exhaustion policy.
    #[inline]
    #[must_use]
    pub const fn with_exhaustion(mut self, exhaustion: ExhaustionPolicy) -> Self {
        self.exhaustion = exhaustion;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::config("max_pool_size must be at least 1"));
        }
        if self.max_sharers_per_entry == 0 {
            return Err(Error::config("max_sharers_per_entry must be at least 1"));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::config("idle_timeout must be non-zero"));
        }
        Ok(())
    }

    /// Checks that `other` matches these settings field by field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first setting that differs.
    pub fn ensure_matches(&self, other: &Self) -> Result<()> {
        if self.enabled != other.enabled {
            return Err(Error::settings_modified("pooling enabled", self.enabled));
        }
        if self.max_pool_size != other.max_pool_size {
            return Err(Error::settings_modified("max_pool_size", self.max_pool_size));
        }
        if self.max_sharers_per_entry != other.max_sharers_per_entry {
            return Err(Error::settings_modified(
                "max_sharers_per_entry",
                self.max_sharers_per_entry,
            ));
        }
        if self.idle_timeout != other.idle_timeout {
            return Err(Error::settings_modified(
                "idle_timeout",
                format_args!("{}ms", self.idle_timeout.as_millis()),
            ));
        }
        if self.exhaustion != other.exhaustion {
            return Err(Error::settings_modified("exhaustion policy", self.exhaustion));
        }
        Ok(())
    }
}

// ============================================================================
// EndpointSettings
// ============================================================================

/// Endpoint addressing.
///
/// Defaults to plain addressing on the transport's default port, which is
/// what [`NetworkConnector`](super::NetworkConnector) can dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Use TLS (`wss`) rather than plain (`ws`/`tcp`) addressing.
    ///
    /// No TLS stack is linked; secure endpoints need a TLS-terminating
    /// gateway or a custom [`ConnectionFactory`](super::ConnectionFactory).
    pub secure: bool,
    /// Port override; the transport default when `None`.
    pub port: Option<u16>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            secure: false,
            port: None,
        }
    }
}

impl EndpointSettings {
    /// Plain-text endpoint on `port`, for local gateways and tests.
    #[inline]
    #[must_use]
    pub const fn insecure(port: u16) -> Self {
        Self {
            secure: false,
            port: Some(port),
        }
    }
}

// ============================================================================
// TransportSettings
// ============================================================================

/// Settings fixed for the lifetime of a transport handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Wire protocol and carrier.
    pub transport_type: TransportType,
    /// Upper bound on one handler operation.
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    /// Pooling settings.
    pub pooling: PoolingSettings,
    /// Byte-channel settings.
    pub channel: ChannelConfig,
    /// Endpoint addressing.
    pub endpoint: EndpointSettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new(TransportType::default())
    }
}

impl TransportSettings {
    /// Creates settings for `transport_type` with defaults.
    #[must_use]
    pub fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            pooling: PoolingSettings::new(),
            channel: ChannelConfig::default(),
            endpoint: EndpointSettings::default(),
        }
    }

    /// Loads settings from JSON; missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if parsing fails, or [`Error::Config`] if the
    /// result is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sets the operation timeout.
    #[inline]
    #[must_use]
    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Sets the pooling settings.
    #[inline]
    #[must_use]
    pub fn with_pooling(mut self, pooling: PoolingSettings) -> Self {
        self.pooling = pooling;
        self
    }

    /// Sets the channel settings.
    #[inline]
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the endpoint settings.
    #[inline]
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: EndpointSettings) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Validates all nested settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout.is_zero() {
            return Err(Error::config("operation_timeout must be non-zero"));
        }
        self.pooling.validate()?;
        self.channel.validate()
    }

    /// Returns the resolved endpoint port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.endpoint
            .port
            .unwrap_or_else(|| self.transport_type.default_port(self.endpoint.secure))
    }

    /// Builds the endpoint URL for `host`.
    ///
    /// `ws(s)://host[:port]/$iothub/websocket` for WebSocket transports,
    /// `tcp://host:port` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if `host` is not a valid host name.
    pub fn endpoint_url(&self, host: &str) -> Result<Url> {
        let port = self.port();
        let url = if self.transport_type.is_websocket() {
            let scheme = if self.endpoint.secure { "wss" } else { "ws" };
            match self.endpoint.port {
                Some(port) => Url::parse(&format!("{scheme}://{host}:{port}{WEBSOCKET_PATH}"))?,
                None => Url::parse(&format!("{scheme}://{host}{WEBSOCKET_PATH}"))?,
            }
        } else {
            Url::parse(&format!("tcp://{host}:{port}"))?
        };
        Ok(url)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TransportSettings::default();
        assert_eq!(settings.transport_type, TransportType::AmqpTcp);
        assert_eq!(settings.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert!(!settings.pooling.enabled);
        assert_eq!(settings.pooling.exhaustion, ExhaustionPolicy::Fail);
        assert!(!settings.endpoint.secure);
        assert_eq!(settings.port(), 5672);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let json = r#"{
            "transport_type": "mqtt_web_socket",
            "operation_timeout": 1500,
            "pooling": { "enabled": true, "max_pool_size": 10, "idle_timeout": 60000 }
        }"#;
        let settings = TransportSettings::from_json(json).unwrap();
        assert_eq!(settings.transport_type, TransportType::MqttWebSocket);
        assert_eq!(settings.operation_timeout, Duration::from_millis(1500));
        assert!(settings.pooling.enabled);
        assert_eq!(settings.pooling.max_pool_size, 10);
        assert_eq!(settings.pooling.idle_timeout, Duration::from_secs(60));
        assert_eq!(
            settings.pooling.max_sharers_per_entry,
            DEFAULT_MAX_SHARERS_PER_ENTRY
        );
    }

    #[test]
    fn test_exhaustion_policy_json() {
        let json = r#"{ "pooling": { "exhaustion": { "policy": "wait", "timeout": 250 } } }"#;
        let settings = TransportSettings::from_json(json).unwrap();
        assert_eq!(
            settings.pooling.exhaustion,
            ExhaustionPolicy::Wait {
                timeout: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_from_json_rejects_zero_pool() {
        let json = r#"{ "pooling": { "max_pool_size": 0 } }"#;
        let err = TransportSettings::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_ensure_matches_names_setting() {
        let first = PoolingSettings::enabled().with_max_pool_size(10);
        let second = PoolingSettings::enabled().with_max_pool_size(7);
        let err = first.ensure_matches(&second).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("max_pool_size"));
        assert!(message.contains("cannot be modified from the initial settings"));
        assert!(message.contains("10"));
        assert!(first.ensure_matches(&first).is_ok());
    }

    #[test]
    fn test_endpoint_urls() {
        let ws = TransportSettings::new(TransportType::MqttWebSocket);
        assert_eq!(
            ws.endpoint_url("hub.example.net").unwrap().as_str(),
            "ws://hub.example.net/$iothub/websocket"
        );

        let secure = TransportSettings::new(TransportType::MqttWebSocket).with_endpoint(
            EndpointSettings {
                secure: true,
                port: None,
            },
        );
        assert_eq!(
            secure.endpoint_url("hub.example.net").unwrap().as_str(),
            "wss://hub.example.net/$iothub/websocket"
        );

        let local = TransportSettings::new(TransportType::AmqpWebSocket)
            .with_endpoint(EndpointSettings::insecure(8080));
        assert_eq!(
            local.endpoint_url("127.0.0.1").unwrap().as_str(),
            "ws://127.0.0.1:8080/$iothub/websocket"
        );

        let tcp = TransportSettings::new(TransportType::MqttTcp);
        assert_eq!(tcp.port(), 1883);
        let url = tcp.endpoint_url("hub.example.net").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.port(), Some(1883));
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(TransportType::AmqpTcp.default_port(true), 5671);
        assert_eq!(TransportType::AmqpTcp.default_port(false), 5672);
        assert_eq!(TransportType::MqttTcp.default_port(false), 1883);
        assert_eq!(TransportType::MqttWebSocket.default_port(true), 443);
    }

    #[test]
    fn test_subprotocols() {
        assert_eq!(TransportType::AmqpWebSocket.subprotocol(), "AMQPWSB10");
        assert_eq!(TransportType::MqttWebSocket.subprotocol(), "mqtt");
        assert_eq!(TransportType::MqttTcp.to_string(), "mqtt_tcp");
    }
}
