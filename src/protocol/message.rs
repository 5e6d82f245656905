//! Device message model.
//!
//! A [`Message`] is what callers send and receive. The body is opaque bytes;
//! properties are string pairs carried alongside it. Inbound messages carry
//! the [`DeliveryTag`] needed to settle them.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::identifiers::DeliveryTag;

// ============================================================================
// Message
// ============================================================================

/// A device-to-cloud or cloud-to-device message.
///
/// # Format
///
/// ```json
/// {
///   "messageId": "optional id",
///   "body": "base64",
///   "properties": { "key": "value" },
///   "deliveryTag": "set on inbound messages"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Application message ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Opaque payload.
    #[serde(with = "base64_body")]
    pub body: Bytes,

    /// Application properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    /// Tag for settling an inbound message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_tag: Option<DeliveryTag>,
}

impl Message {
    /// Creates a message with the given body.
    #[inline]
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Sets the message ID.
    #[inline]
    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Adds an application property.
    #[inline]
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the delivery tag.
    #[inline]
    #[must_use]
    pub fn with_delivery_tag(mut self, tag: DeliveryTag) -> Self {
        self.delivery_tag = Some(tag);
        self
    }

    /// Returns a property value.
    #[inline]
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

// ============================================================================
// Body Encoding
// ============================================================================

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let message = Message::new("temp=21")
            .with_message_id("m-1")
            .with_property("alert", "false");

        assert_eq!(&message.body[..], b"temp=21");
        assert_eq!(message.message_id.as_deref(), Some("m-1"));
        assert_eq!(message.property("alert"), Some("false"));
        assert!(message.delivery_tag.is_none());
    }

    #[test]
    fn test_body_serialized_as_base64() {
        let message = Message::new(&b"hi"[..]);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["body"], "aGk=");
        assert!(json.get("properties").is_none());
        assert!(json.get("deliveryTag").is_none());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"body":"***"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_inbound_message_parses_tag() {
        let json = r#"{"body":"aGk=","deliveryTag":"t-7","properties":{"k":"v"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.delivery_tag, Some(DeliveryTag::new("t-7")));
        assert_eq!(message.property("k"), Some("v"));
        assert_eq!(&message.body[..], b"hi");
    }
}
