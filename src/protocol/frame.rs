//! Wire frames for the reference framed protocol.
//!
//! Each frame is a JSON object tagged by `type`. Requests carry an `id`
//! that the peer echoes in an `outcome` frame.
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `attach` | Device → Cloud | Open a device session on the connection |
//! | `detach` | Device → Cloud | Close a device session |
//! | `send` | Device → Cloud | One message, or a batch settled as a unit |
//! | `settle` | Device → Cloud | Complete, abandon or reject a delivery |
//! | `deliver` | Cloud → Device | Inbound message with delivery tag |
//! | `outcome` | Cloud → Device | Result of a correlated request |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::identifiers::{DeliveryTag, RequestId};

use super::Message;

// ============================================================================
// Disposition
// ============================================================================

/// Settlement outcome for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
    /// Message processed; remove it.
    Complete,
    /// Message not processed; make it available again.
    Abandon,
    /// Message cannot be processed; dead-letter it.
    Reject,
}

impl Disposition {
    /// Returns the operation name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::Reject => "reject",
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One protocol frame.
///
/// # Format
///
/// ```json
/// { "type": "send", "id": "uuid", "device": "dev-1", "messages": [ ... ] }
/// { "type": "outcome", "id": "uuid", "error": "optional message" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Open a device session.
    Attach {
        /// Correlation ID.
        id: RequestId,
        /// Session name (`device` or `device/module`).
        device: String,
    },

    /// Close a device session.
    Detach {
        /// Correlation ID.
        id: RequestId,
        /// Session name.
        device: String,
    },

    /// Send one or more messages as one unit.
    Send {
        /// Correlation ID.
        id: RequestId,
        /// Session name.
        device: String,
        /// Messages, accepted or rejected together.
        messages: Vec<Message>,
    },

    /// Settle a delivery.
    Settle {
        /// Correlation ID.
        id: RequestId,
        /// Session name.
        device: String,
        /// Tag of the delivery being settled.
        tag: DeliveryTag,
        /// Settlement outcome.
        outcome: Disposition,
    },

    /// Inbound message for a session.
    Deliver {
        /// Session name.
        device: String,
        /// The message; carries its delivery tag.
        message: Message,
    },

    /// Result of a correlated request.
    Outcome {
        /// Echoed correlation ID.
        id: RequestId,
        /// Error message if the request failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    /// Returns the correlation ID of a request or outcome frame.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Attach { id, .. }
            | Self::Detach { id, .. }
            | Self::Send { id, .. }
            | Self::Settle { id, .. }
            | Self::Outcome { id, .. } => Some(*id),
            Self::Deliver { .. } => None,
        }
    }

    /// Returns `true` for frames a device may receive.
    #[inline]
    #[must_use]
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Deliver { .. } | Self::Outcome { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_send_frame_format() {
        let id = RequestId::generate();
        let frame = Frame::Send {
            id,
            device: "dev-1".into(),
            messages: vec![Message::new(&b"a"[..])],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["device"], "dev-1");
        assert_eq!(value["messages"][0]["body"], "YQ==");
        assert_eq!(frame.request_id(), Some(id));
        assert!(!frame.is_inbound());
    }

    #[test]
    fn test_outcome_without_error() {
        let id = RequestId::generate();
        let value = json!({ "type": "outcome", "id": id });
        let frame: Frame = serde_json::from_value(value).unwrap();
        assert_eq!(frame, Frame::Outcome { id, error: None });
        assert!(frame.is_inbound());
    }

    #[test]
    fn test_settle_disposition_names() {
        let frame = Frame::Settle {
            id: RequestId::generate(),
            device: "dev-1".into(),
            tag: DeliveryTag::new("t-1"),
            outcome: Disposition::Abandon,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["outcome"], "abandon");
        assert_eq!(Disposition::Reject.as_str(), "reject");
    }

    #[test]
    fn test_deliver_has_no_request_id() {
        let frame = Frame::Deliver {
            device: "dev-1".into(),
            message: Message::new(&b"x"[..]).with_delivery_tag(DeliveryTag::new("t")),
        };
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_value::<Frame>(json!({ "type": "bogus" }));
        assert!(result.is_err());
    }
}
