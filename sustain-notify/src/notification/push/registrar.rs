//! Push registration: the local half of a push subscription.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::subscription::{PushKeys, PushSubscription};
use super::web_push::{AUTH_SECRET_LEN, decode_b64url, decrypt_payload, encode_b64url};
use crate::{Error, Result};

/// Platform push registration API.
#[async_trait]
pub trait PushRegistrar: Send + Sync {
    /// Obtain a subscription, reusing the current one if present.
    async fn subscribe(&self, application_server_key: Option<&str>) -> Result<PushSubscription>;

    /// The current subscription, if any.
    async fn current(&self) -> Option<PushSubscription>;

    /// Drop the current subscription. Returns whether one existed.
    async fn unsubscribe(&self) -> Result<bool>;
}

struct Registration {
    subscription: PushSubscription,
    secret: p256::SecretKey,
    auth: [u8; AUTH_SECRET_LEN],
}

/// Key file contents.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRegistration {
    subscription: PushSubscription,
    private_key: String,
    auth: String,
}

impl Registration {
    fn to_stored(&self) -> StoredRegistration {
        StoredRegistration {
            subscription: self.subscription.clone(),
            private_key: encode_b64url(&self.secret.to_bytes()),
            auth: encode_b64url(&self.auth),
        }
    }

    fn from_stored(stored: StoredRegistration) -> Result<Self> {
        let secret = decode_b64url(&stored.private_key)
            .ok()
            .and_then(|bytes| p256::SecretKey::from_slice(&bytes).ok())
            .ok_or_else(|| Error::push("invalid stored private key"))?;
        let auth: [u8; AUTH_SECRET_LEN] = decode_b64url(&stored.auth)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::push("invalid stored auth secret"))?;

        let public = secret.public_key().to_encoded_point(false);
        if encode_b64url(public.as_bytes()) != stored.subscription.keys.p256dh {
            return Err(Error::push("stored key does not match its subscription"));
        }
        Ok(Self {
            subscription: stored.subscription,
            secret,
            auth,
        })
    }
}

/// Registrar that mints subscriptions for a configured device endpoint.
///
/// Each subscription gets a fresh P-256 key pair and a 16-byte auth secret.
/// The private half stays here so pushed payloads can be decrypted.
pub struct KeypairRegistrar {
    device_endpoint: String,
    key_file: Option<PathBuf>,
    registration: Mutex<Option<Registration>>,
}

impl KeypairRegistrar {
    pub fn new(device_endpoint: impl Into<String>) -> Self {
        Self {
            device_endpoint: device_endpoint.into(),
            key_file: None,
            registration: Mutex::new(None),
        }
    }

    /// Keep the registration in `path`, loading what is already there.
    ///
    /// An unreadable key file is discarded with a warning.
    pub fn with_key_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let loaded = serde_json::from_str::<StoredRegistration>(&text)
                .map_err(Error::from)
                .and_then(Registration::from_stored);
            match loaded {
                Ok(registration) => {
                    debug!(path = %path.display(), "Loaded push registration");
                    *self.registration.get_mut() = Some(registration);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring corrupt push key file"),
            }
        } else if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        self.key_file = Some(path);
        Ok(self)
    }

    fn save(&self, registration: &Registration) -> Result<()> {
        let Some(path) = &self.key_file else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&registration.to_stored())?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn forget_saved(&self) -> Result<()> {
        let Some(path) = &self.key_file else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn register(&self) -> Registration {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        let mut auth = [0u8; AUTH_SECRET_LEN];
        OsRng.fill_bytes(&mut auth);

        let endpoint = format!(
            "{}/{}",
            self.device_endpoint.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        Registration {
            subscription: PushSubscription {
                endpoint,
                expiration_time: None,
                keys: PushKeys {
                    p256dh: encode_b64url(public.as_bytes()),
                    auth: encode_b64url(&auth),
                },
            },
            secret,
            auth,
        }
    }

    /// Decrypt an `aes128gcm` body pushed to the current subscription.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>> {
        let guard = self.registration.lock();
        let registration = guard
            .as_ref()
            .ok_or_else(|| Error::push("No active push registration"))?;
        decrypt_payload(body, &registration.secret, &registration.auth)
    }
}

#[async_trait]
impl PushRegistrar for KeypairRegistrar {
    async fn subscribe(&self, application_server_key: Option<&str>) -> Result<PushSubscription> {
        if self.device_endpoint.trim().is_empty() {
            return Err(Error::push("No push endpoint configured for this device"));
        }

        let mut registration = self.registration.lock();
        if let Some(existing) = registration.as_ref() {
            debug!("Reusing existing push registration");
            return Ok(existing.subscription.clone());
        }

        let fresh = self.register();
        self.save(&fresh)?;
        info!(
            endpoint = %fresh.subscription.endpoint,
            server_key = application_server_key.is_some(),
            "Registered push subscription"
        );
        let subscription = fresh.subscription.clone();
        *registration = Some(fresh);
        Ok(subscription)
    }

    async fn current(&self) -> Option<PushSubscription> {
        self.registration
            .lock()
            .as_ref()
            .map(|r| r.subscription.clone())
    }

    async fn unsubscribe(&self) -> Result<bool> {
        let existed = self.registration.lock().take().is_some();
        self.forget_saved()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::push::web_push::{PUBLIC_KEY_LEN, decode_b64url, encrypt_payload};

    #[tokio::test]
    async fn test_subscription_shape_and_reuse() {
        let registrar = KeypairRegistrar::new("https://push.example.com/send/");
        let sub = registrar.subscribe(None).await.unwrap();

        assert!(sub.endpoint.starts_with("https://push.example.com/send/"));
        assert!(!sub.endpoint.ends_with('/'));
        assert_eq!(decode_b64url(&sub.keys.p256dh).unwrap().len(), PUBLIC_KEY_LEN);
        assert_eq!(decode_b64url(&sub.keys.auth).unwrap().len(), AUTH_SECRET_LEN);

        assert_eq!(registrar.subscribe(None).await.unwrap(), sub);
        assert_eq!(registrar.current().await, Some(sub));

        assert!(registrar.unsubscribe().await.unwrap());
        assert!(!registrar.unsubscribe().await.unwrap());
        assert!(registrar.current().await.is_none());
    }

    #[tokio::test]
    async fn test_decrypts_payload_sent_to_subscription() {
        let registrar = KeypairRegistrar::new("https://push.example.com/send");
        let sub = registrar.subscribe(None).await.unwrap();

        let public: [u8; PUBLIC_KEY_LEN] =
            decode_b64url(&sub.keys.p256dh).unwrap().try_into().unwrap();
        let auth: [u8; AUTH_SECRET_LEN] =
            decode_b64url(&sub.keys.auth).unwrap().try_into().unwrap();
        let body = encrypt_payload(b"hello", &public, &auth).unwrap();

        assert_eq!(registrar.decrypt(&body).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_key_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("push-keys.json");

        let first = KeypairRegistrar::new("https://push.example.com/send")
            .with_key_file(&path)
            .unwrap();
        let sub = first.subscribe(None).await.unwrap();
        assert!(path.exists());

        let reopened = KeypairRegistrar::new("https://push.example.com/send")
            .with_key_file(&path)
            .unwrap();
        assert_eq!(reopened.current().await, Some(sub.clone()));

        let public: [u8; PUBLIC_KEY_LEN] =
            decode_b64url(&sub.keys.p256dh).unwrap().try_into().unwrap();
        let auth: [u8; AUTH_SECRET_LEN] =
            decode_b64url(&sub.keys.auth).unwrap().try_into().unwrap();
        let body = encrypt_payload(b"still here", &public, &auth).unwrap();
        assert_eq!(reopened.decrypt(&body).unwrap(), b"still here");

        assert!(reopened.unsubscribe().await.unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_key_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push-keys.json");
        std::fs::write(&path, "{\"subscription\": 1}").unwrap();

        let registrar = KeypairRegistrar::new("https://push.example.com/send")
            .with_key_file(&path)
            .unwrap();
        assert!(registrar.registration.lock().is_none());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_an_error() {
        let registrar = KeypairRegistrar::new("");
        assert!(registrar.subscribe(None).await.is_err());
    }
}
