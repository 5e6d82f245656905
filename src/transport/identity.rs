//! Connection identity and pooling key.
//!
//! A connection string is a `;`-separated list of `Name=Value` pairs:
//!
//! ```text
//! HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey=...
//! ```
//!
//! Only the identity fields are read. Key material is ignored here and
//! handled by the credential layer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};

use super::settings::TransportType;

// ============================================================================
// ConnectionIdentity
// ============================================================================

/// Who is connecting, and to which hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    /// Service host name.
    pub host_name: String,
    /// Device ID.
    pub device_id: String,
    /// Module ID for module identities.
    pub module_id: Option<String>,
    /// Shared access policy name for group credentials.
    pub shared_access_key_name: Option<String>,
}

impl ConnectionIdentity {
    /// Creates a device identity.
    #[must_use]
    pub fn new(host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            module_id: None,
            shared_access_key_name: None,
        }
    }

    /// Sets the module ID.
    #[inline]
    #[must_use]
    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    /// Sets the shared access policy name.
    #[inline]
    #[must_use]
    pub fn with_shared_access_key_name(mut self, name: impl Into<String>) -> Self {
        self.shared_access_key_name = Some(name.into());
        self
    }

    /// Parses the identity fields of a connection string.
    ///
    /// Names are matched case-insensitively. Unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a segment has no `=`, or if `HostName`
    /// or `DeviceId` is missing or empty.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut key_name = None;

        for segment in connection_string.split(';').map(str::trim) {
            if segment.is_empty() {
                continue;
            }
            // Values such as base64 keys may contain '='.
            let (name, value) = segment.split_once('=').ok_or_else(|| {
                Error::config(format!("malformed connection string segment '{segment}'"))
            })?;
            let value = value.trim().to_string();

            match name.trim().to_ascii_lowercase().as_str() {
                "hostname" => host_name = Some(value),
                "deviceid" => device_id = Some(value),
                "moduleid" => module_id = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                _ => {}
            }
        }

        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::config("connection string is missing HostName"))?;
        let device_id = device_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::config("connection string is missing DeviceId"))?;

        Ok(Self {
            host_name,
            device_id,
            module_id: module_id.filter(|v| !v.is_empty()),
            shared_access_key_name: key_name.filter(|v| !v.is_empty()),
        })
    }

    /// Returns the session name used on a shared connection.
    ///
    /// `device` for device identities, `device/module` for modules.
    #[must_use]
    pub fn session_name(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{module}", self.device_id),
            None => self.device_id.clone(),
        }
    }

    /// Computes the pooling key for this identity over `transport_type`.
    #[inline]
    #[must_use]
    pub fn pool_key(&self, transport_type: TransportType) -> PoolKey {
        PoolKey::new(self, transport_type)
    }
}

// ============================================================================
// PoolKey
// ============================================================================

/// Identity of a set of shareable connections.
///
/// Group credentials share one pool per policy name; device credentials
/// get a pool per device. Host names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    host: String,
    scope: String,
    transport_type: TransportType,
}

impl PoolKey {
    /// Computes the key for `identity` over `transport_type`.
    #[must_use]
    pub fn new(identity: &ConnectionIdentity, transport_type: TransportType) -> Self {
        let scope = identity
            .shared_access_key_name
            .clone()
            .unwrap_or_else(|| identity.device_id.clone());
        Self {
            host: identity.host_name.to_ascii_lowercase(),
            scope,
            transport_type,
        }
    }

    /// Returns the normalized host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the credential scope.
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the transport type.
    #[inline]
    #[must_use]
    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.transport_type, self.host, self.scope)
    }
}

// ============================================================================
// Tests
// ============================================================================
