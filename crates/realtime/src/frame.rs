//! Wire frames exchanged with the realtime endpoint.
//!
//! The endpoint speaks the Phoenix channel dialect: every text frame is a JSON
//! object `{topic, event, payload, ref}`. Only a handful of events are
//! interpreted here; everything else is passed through as an opaque message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Event sent to join a topic.
pub const JOIN_EVENT: &str = "phx_join";
/// Server acknowledgement of a join/heartbeat.
pub const REPLY_EVENT: &str = "phx_reply";
/// Topic reserved for connection heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Application event carrying a delivery status change.
pub const DELIVERY_UPDATE_EVENT: &str = "delivery_update";
/// Database change feed event.
pub const POSTGRES_CHANGES_EVENT: &str = "postgres_changes";

/// A single Phoenix channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// Client reference. Servers echo it back as either a string or a number.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Value>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }

    /// Join frame for `topic` with an empty payload.
    pub fn join(topic: impl Into<String>, reference: u64) -> Self {
        Self::new(topic, JOIN_EVENT, Value::Object(Default::default()))
            .with_reference(reference)
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self::new(
            HEARTBEAT_TOPIC,
            HEARTBEAT_EVENT,
            Value::Object(Default::default()),
        )
        .with_reference(reference)
    }

    pub fn with_reference(mut self, reference: u64) -> Self {
        self.reference = Some(Value::String(reference.to_string()));
        self
    }

    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the frame as JSON text.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_reply(&self) -> bool {
        self.event == REPLY_EVENT
    }
}

/// The most recent inbound message, as exposed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Frame event, or `"unknown"` when the frame carried none.
    pub kind: String,
    /// Frame payload; the whole frame when the payload is empty.
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        let kind = if frame.event.is_empty() {
            "unknown".to_string()
        } else {
            frame.event.clone()
        };
        let data = if frame.payload.is_null() {
            serde_json::to_value(frame).unwrap_or(Value::Null)
        } else {
            frame.payload.clone()
        };
        Self {
            kind,
            data,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_frame_shape() {
        let frame = Frame::join("user:42", 7);
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["topic"], "user:42");
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["payload"], json!({}));
        assert_eq!(value["ref"], "7");
    }

    #[test]
    fn test_parse_accepts_numeric_ref_and_missing_payload() {
        let frame = Frame::parse(r#"{"topic":"user:1","event":"ping","ref":1718000000}"#).unwrap();
        assert_eq!(frame.event, "ping");
        assert!(frame.payload.is_null());
        assert_eq!(frame.reference, Some(json!(1718000000u64)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Frame::parse("not json").is_err());
        assert!(Frame::parse("[1,2,3]").is_err());
    }

    #[test]
    fn test_inbound_message_defaults() {
        let frame = Frame::parse(r#"{"topic":"t"}"#).unwrap();
        let message = InboundMessage::from_frame(&frame);
        assert_eq!(message.kind, "unknown");
        assert_eq!(message.data["topic"], "t");

        let frame = Frame::new("t", "delivery_update", json!({"title": "x"}));
        let message = InboundMessage::from_frame(&frame);
        assert_eq!(message.kind, "delivery_update");
        assert_eq!(message.data, json!({"title": "x"}));
    }
}
