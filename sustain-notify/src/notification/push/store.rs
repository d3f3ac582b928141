//! Remote persistence of push subscriptions, keyed by user id.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::subscription::PushSubscriptionRecord;
use crate::{Error, Result};

/// Table holding one subscription row per user.
pub const SUBSCRIPTIONS_TABLE: &str = "push_subscriptions";

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or overwrite the row for `record.user_id`.
    async fn upsert(&self, record: &PushSubscriptionRecord) -> Result<()>;

    /// Delete the row for `user_id`. Deleting a missing row is not an error.
    async fn delete(&self, user_id: &str) -> Result<()>;

    async fn exists(&self, user_id: &str) -> Result<bool>;
}

/// Store speaking the backend's REST dialect.
#[derive(Debug, Clone)]
pub struct RestSubscriptionStore {
    client: reqwest::Client,
    table_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestSubscriptionStore {
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
            table_url: format!(
                "{}/rest/v1/{}",
                base_url.trim_end_matches('/'),
                SUBSCRIPTIONS_TABLE
            ),
            api_key: api_key.into(),
            access_token,
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, &self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }
}

async fn check_status(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Other(format!(
        "{} on {} failed with {}: {}",
        operation,
        SUBSCRIPTIONS_TABLE,
        status,
        body.chars().take(300).collect::<String>()
    )))
}

#[async_trait]
impl SubscriptionStore for RestSubscriptionStore {
    async fn upsert(&self, record: &PushSubscriptionRecord) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST)
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(record)
            .send()
            .await?;
        check_status(response, "upsert").await?;
        debug!(user_id = %record.user_id, "Push subscription persisted");
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        let filter = format!("eq.{}", user_id);
        let response = self
            .request(reqwest::Method::DELETE)
            .query(&[("user_id", filter.as_str())])
            .send()
            .await?;
        check_status(response, "delete").await?;
        debug!(%user_id, "Push subscription deleted");
        Ok(())
    }

    async fn exists(&self, user_id: &str) -> Result<bool> {
        let filter = format!("eq.{}", user_id);
        let response = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "user_id"),
                ("user_id", filter.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = check_status(response, "select").await?.json().await?;
        Ok(!rows.is_empty())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    rows: DashMap<String, PushSubscriptionRecord>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<PushSubscriptionRecord> {
        self.rows.get(user_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn upsert(&self, record: &PushSubscriptionRecord) -> Result<()> {
        self.rows.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.rows.remove(user_id);
        Ok(())
    }

    async fn exists(&self, user_id: &str) -> Result<bool> {
        Ok(self.rows.contains_key(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::push::subscription::{PushKeys, PushSubscription};

    fn record(user: &str, endpoint: &str) -> PushSubscriptionRecord {
        PushSubscriptionRecord::new(
            user,
            &PushSubscription {
                endpoint: endpoint.to_string(),
                expiration_time: None,
                keys: PushKeys {
                    p256dh: "k".to_string(),
                    auth: "a".to_string(),
                },
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_upsert_overwrites_per_user() {
        let store = MemorySubscriptionStore::new();
        store.upsert(&record("u1", "https://a")).await.unwrap();
        store.upsert(&record("u1", "https://b")).await.unwrap();

        assert_eq!(store.len(), 1);
        let row = store.get("u1").unwrap();
        assert_eq!(row.subscription().unwrap().endpoint, "https://b");

        store.delete("u1").await.unwrap();
        store.delete("u1").await.unwrap();
        assert!(!store.exists("u1").await.unwrap());
    }

    #[test]
    fn test_rest_store_table_url() {
        let store = RestSubscriptionStore::new("https://db.example.com/", "anon", None).unwrap();
        assert_eq!(
            store.table_url,
            "https://db.example.com/rest/v1/push_subscriptions"
        );
    }
}
