//! Events surfaced by the realtime channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{DELIVERY_UPDATE_EVENT, Frame, InboundMessage, POSTGRES_CHANGES_EVENT};

const DEFAULT_UPDATE_TITLE: &str = "Delivery Update";
const DEFAULT_UPDATE_MESSAGE: &str = "You have a new delivery update";

/// Connection status of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// A delivery status change pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    pub title: String,
    pub message: String,
    /// Delivery identifier, when the frame carried one.
    pub delivery_id: Option<String>,
    pub status: Option<String>,
}

impl DeliveryUpdate {
    /// Interpret a frame as a delivery update.
    ///
    /// Recognizes the explicit `delivery_update` event and `UPDATE` rows from the
    /// database change feed whose `status` column changed. Returns `None` for
    /// anything else.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.event.as_str() {
            DELIVERY_UPDATE_EVENT => Some(Self::from_event_payload(&frame.payload)),
            POSTGRES_CHANGES_EVENT => Self::from_change_payload(&frame.payload),
            _ => None,
        }
    }

    fn from_event_payload(payload: &Value) -> Self {
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            title: text("title").unwrap_or_else(|| DEFAULT_UPDATE_TITLE.to_string()),
            message: text("message").unwrap_or_else(|| DEFAULT_UPDATE_MESSAGE.to_string()),
            delivery_id: text("delivery_id").or_else(|| text("deliveryId")),
            status: text("status"),
        }
    }

    fn from_change_payload(payload: &Value) -> Option<Self> {
        // Change rows arrive either wrapped in `data` or flat.
        let data = payload.get("data").unwrap_or(payload);
        let change_type = data
            .get("type")
            .or_else(|| data.get("eventType"))
            .and_then(Value::as_str)?;
        if !change_type.eq_ignore_ascii_case("UPDATE") {
            return None;
        }

        let record = data.get("record").or_else(|| data.get("new"))?;
        let old_record = data.get("old_record").or_else(|| data.get("old"));

        let status = record.get("status").and_then(Value::as_str)?;
        let old_status = old_record
            .and_then(|old| old.get("status"))
            .and_then(Value::as_str);
        if old_status == Some(status) {
            return None;
        }

        Some(Self {
            title: DEFAULT_UPDATE_TITLE.to_string(),
            message: format!("Delivery status changed to {}", status),
            delivery_id: record.get("id").and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            status: Some(status.to_string()),
        })
    }
}

/// Events broadcast to channel subscribers.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// The connection status changed.
    StatusChanged(ConnectionStatus),
    /// Any well-formed inbound frame.
    Message(InboundMessage),
    /// A recognized delivery update.
    DeliveryUpdate(DeliveryUpdate),
    /// Reconnect attempts are exhausted; the channel stays down until the next
    /// explicit `connect()`.
    ConnectionFailed { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delivery_update_event_defaults() {
        let frame = Frame::new("user:1", "delivery_update", json!({}));
        let update = DeliveryUpdate::from_frame(&frame).unwrap();
        assert_eq!(update.title, "Delivery Update");
        assert_eq!(update.message, "You have a new delivery update");
        assert_eq!(update.delivery_id, None);
    }

    #[test]
    fn test_delivery_update_event_fields() {
        let frame = Frame::new(
            "user:1",
            "delivery_update",
            json!({"title": "On the way", "message": "Driver left the depot", "deliveryId": "d-9"}),
        );
        let update = DeliveryUpdate::from_frame(&frame).unwrap();
        assert_eq!(update.title, "On the way");
        assert_eq!(update.message, "Driver left the depot");
        assert_eq!(update.delivery_id.as_deref(), Some("d-9"));
    }

    #[test]
    fn test_change_feed_status_transition() {
        let frame = Frame::new(
            "realtime:delivery-tracking",
            "postgres_changes",
            json!({
                "data": {
                    "table": "delivery_assignments",
                    "type": "UPDATE",
                    "record": {"id": "a1", "status": "in_transit"},
                    "old_record": {"id": "a1", "status": "assigned"}
                }
            }),
        );
        let update = DeliveryUpdate::from_frame(&frame).unwrap();
        assert_eq!(update.message, "Delivery status changed to in_transit");
        assert_eq!(update.delivery_id.as_deref(), Some("a1"));
        assert_eq!(update.status.as_deref(), Some("in_transit"));
    }

    #[test]
    fn test_change_feed_ignores_unchanged_status_and_inserts() {
        let unchanged = Frame::new(
            "t",
            "postgres_changes",
            json!({"data": {"type": "UPDATE",
                "record": {"id": 3, "status": "assigned", "eta_minutes": 4},
                "old_record": {"id": 3, "status": "assigned"}}}),
        );
        assert!(DeliveryUpdate::from_frame(&unchanged).is_none());

        let insert = Frame::new(
            "t",
            "postgres_changes",
            json!({"data": {"type": "INSERT", "record": {"id": 3, "status": "assigned"}}}),
        );
        assert!(DeliveryUpdate::from_frame(&insert).is_none());
    }

    #[test]
    fn test_unrelated_events_are_not_updates() {
        let frame = Frame::new("user:1", "phx_reply", json!({"status": "ok"}));
        assert!(DeliveryUpdate::from_frame(&frame).is_none());
    }
}
