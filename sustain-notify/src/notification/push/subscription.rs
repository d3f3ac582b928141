//! Push subscription shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Browser-shaped push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
    pub endpoint: String,
    #[serde(default)]
    pub expiration_time: Option<i64>,
    pub keys: PushKeys,
}

/// Client keys, base64url without padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Row stored remotely, one per user.
///
/// The subscription is kept verbatim as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscriptionRecord {
    pub user_id: String,
    pub subscription: String,
    pub created_at: DateTime<Utc>,
}

impl PushSubscriptionRecord {
    pub fn new(user_id: impl Into<String>, subscription: &PushSubscription) -> Result<Self> {
        Ok(Self {
            user_id: user_id.into(),
            subscription: serde_json::to_string(subscription)?,
            created_at: Utc::now(),
        })
    }

    pub fn subscription(&self) -> Result<PushSubscription> {
        Ok(serde_json::from_str(&self.subscription)?)
    }
}
