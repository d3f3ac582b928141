//! Push relays: hand a message to a remote push service.
//!
//! The pipeline's responsibility ends once the relay request is acknowledged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::subscription::PushSubscription;
use crate::{Error, Result};

/// Backend function that forwards pushes.
pub const SEND_PUSH_FUNCTION: &str = "send-push-notification";

/// Message relayed to a push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>, data: Value) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data,
        }
    }
}

/// Acknowledgement from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReceipt {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Delivers a message to a push subscription through some remote service.
#[async_trait]
pub trait PushRelay: Send + Sync {
    /// Relay name for logs.
    fn name(&self) -> &'static str;

    async fn relay(
        &self,
        subscription: &PushSubscription,
        message: &PushMessage,
    ) -> Result<RelayReceipt>;
}

/// Relay through the backend's `send-push-notification` function.
#[derive(Debug, Clone)]
pub struct EdgeFunctionRelay {
    client: reqwest::Client,
    function_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl EdgeFunctionRelay {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Other(format!("Failed to build reqwest client: {}", e)))?;
        Ok(Self {
            client,
            function_url: format!(
                "{}/functions/v1/{}",
                base_url.trim_end_matches('/'),
                SEND_PUSH_FUNCTION
            ),
            api_key: api_key.into(),
            access_token,
        })
    }

    pub fn function_url(&self) -> &str {
        &self.function_url
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    subscription: &'a PushSubscription,
    notification: &'a PushMessage,
}

#[async_trait]
impl PushRelay for EdgeFunctionRelay {
    fn name(&self) -> &'static str {
        "edge_function"
    }

    async fn relay(
        &self,
        subscription: &PushSubscription,
        message: &PushMessage,
    ) -> Result<RelayReceipt> {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        let response = self
            .client
            .post(&self.function_url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
            .json(&RelayRequest {
                subscription,
                notification: message,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::push(format!(
                "{} returned {}: {}",
                SEND_PUSH_FUNCTION,
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let receipt: RelayReceipt = response.json().await?;
        if !receipt.success {
            return Err(Error::push(format!(
                "{} did not acknowledge the message",
                SEND_PUSH_FUNCTION
            )));
        }
        debug!(message_id = ?receipt.message_id, "Push relayed");
        Ok(receipt)
    }
}
