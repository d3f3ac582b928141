//! Notification kinds, typed payloads and the display text table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Error;

/// Title used when a kind has no entry in the text table.
pub const GENERIC_TITLE: &str = "SustainConnect";
/// Body used when a kind has no entry in the text table.
pub const GENERIC_BODY: &str = "You have a new update";

/// Closed set of notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeliveryReminder,
    PickupReminder,
    StatusUpdate,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliveryReminder => "delivery_reminder",
            Self::PickupReminder => "pickup_reminder",
            Self::StatusUpdate => "status_update",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "delivery_reminder" => Ok(Self::DeliveryReminder),
            "pickup_reminder" => Ok(Self::PickupReminder),
            "status_update" => Ok(Self::StatusUpdate),
            other => Err(Error::validation(format!(
                "unknown notification kind '{}'",
                other
            ))),
        }
    }
}

/// Display data, one variant per kind.
///
/// Serialized with the kind as the `kind` tag and camelCase fields, which is
/// also the `data` object handed to push relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NotificationPayload {
    DeliveryReminder {
        delivery_id: String,
        address: String,
        /// Human readable delivery time.
        time: String,
    },
    PickupReminder {
        donation_id: String,
        address: String,
    },
    StatusUpdate {
        delivery_id: String,
        status: String,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::DeliveryReminder { .. } => NotificationKind::DeliveryReminder,
            Self::PickupReminder { .. } => NotificationKind::PickupReminder,
            Self::StatusUpdate { .. } => NotificationKind::StatusUpdate,
        }
    }

    /// Payload as a JSON object.
    pub fn data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> NotificationText {
        NotificationText::lookup(self.kind().as_str(), &self.data())
    }
}

/// Title and body shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationText {
    pub title: String,
    pub body: String,
}

impl NotificationText {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }

    /// Fixed text table keyed by kind name.
    ///
    /// Unknown kinds get the generic pair. Missing fields render as empty text.
    pub fn lookup(kind: &str, data: &Value) -> Self {
        let field = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
        match kind {
            "delivery_reminder" => Self::new(
                "Delivery Reminder",
                format!(
                    "Your delivery to {} is scheduled for {}",
                    field("address"),
                    field("time")
                ),
            ),
            "pickup_reminder" => Self::new(
                "Pickup Reminder",
                format!(
                    "Don't forget to pickup your donation from {}",
                    field("address")
                ),
            ),
            "status_update" => Self::new(
                "Delivery Update",
                format!(
                    "Your delivery status has been updated to: {}",
                    field("status")
                ),
            ),
            _ => Self::new(GENERIC_TITLE, GENERIC_BODY),
        }
    }
}

/// A notification waiting for its fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub payload: NotificationPayload,
    pub fire_at: DateTime<Utc>,
    /// Set once, never cleared.
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduledNotification {
    pub fn new(payload: NotificationPayload, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            fire_at,
            delivered: false,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.delivered && now >= self.fire_at
    }

    pub fn text(&self) -> NotificationText {
        self.payload.text()
    }
}
