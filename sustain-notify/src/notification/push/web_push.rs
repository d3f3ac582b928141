//! Direct Web Push delivery.
//!
//! Payloads are encrypted with RFC 8291 (`aes128gcm`) and requests are signed
//! with an RFC 8292 VAPID JWT, cached per push-service audience.

use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use dashmap::DashMap;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, warn};
use url::Url;

use super::relay::{PushMessage, PushRelay, RelayReceipt};
use super::subscription::PushSubscription;
use crate::{Error, Result};

const SALT_LEN: usize = 16;
pub(crate) const PUBLIC_KEY_LEN: usize = 65;
pub(crate) const AUTH_SECRET_LEN: usize = 16;
const RECORD_SIZE: u32 = 4096;
const HEADER_LEN: usize = SALT_LEN + 4 + 1;
const MAX_PAYLOAD_BYTES: usize = 3500;
const PUSH_TTL_SECS: u32 = 3600;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);
const VAPID_JWT_EXP_SECS: i64 = 12 * 60 * 60;
const VAPID_JWT_SKEW_SECS: i64 = 60;

const IKM_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const KEY_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";
/// Padding delimiter of the last record.
const LAST_RECORD_DELIMITER: u8 = 2;

/// Application server (VAPID) identity.
#[derive(Debug, Clone)]
pub struct VapidConfig {
    public_key_b64: String,
    private_key_raw: [u8; 32],
    subject: String,
}

impl VapidConfig {
    /// Build from base64url keys: a 65-byte uncompressed public point and a
    /// 32-byte private scalar.
    pub fn from_keys(public_key_b64: &str, private_key_b64: &str, subject: &str) -> Result<Self> {
        let public_raw = decode_b64url(public_key_b64.trim())
            .map_err(|e| Error::config(format!("Invalid VAPID public key: {}", e)))?;
        if public_raw.len() != PUBLIC_KEY_LEN {
            return Err(Error::config(format!(
                "VAPID public key must decode to {} bytes",
                PUBLIC_KEY_LEN
            )));
        }
        let private_raw: [u8; 32] = decode_b64url(private_key_b64.trim())
            .map_err(|e| Error::config(format!("Invalid VAPID private key: {}", e)))?
            .try_into()
            .map_err(|_| Error::config("VAPID private key must decode to 32 bytes"))?;

        let subject = subject.trim();
        Ok(Self {
            public_key_b64: public_key_b64.trim().to_string(),
            private_key_raw: private_raw,
            subject: if subject.is_empty() {
                "mailto:admin@localhost".to_string()
            } else {
                subject.to_string()
            },
        })
    }

    /// Public key handed to registrars as the application server key.
    pub fn public_key(&self) -> &str {
        &self.public_key_b64
    }
}

#[derive(Debug, Clone)]
struct CachedJwt {
    token: String,
    expires_at: i64,
}

/// Relay that talks to the push service directly.
#[derive(Debug)]
pub struct WebPushRelay {
    client: reqwest::Client,
    vapid: VapidConfig,
    jwt_cache: DashMap<String, CachedJwt>,
}

impl WebPushRelay {
    pub fn new(vapid: VapidConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Other(format!("Failed to build reqwest client: {}", e)))?;
        Ok(Self {
            client,
            vapid,
            jwt_cache: DashMap::new(),
        })
    }

    pub fn vapid_public_key(&self) -> &str {
        self.vapid.public_key()
    }

    fn vapid_jwt(&self, audience: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        if let Some(entry) = self.jwt_cache.get(audience)
            && entry.expires_at - VAPID_JWT_SKEW_SECS > now
        {
            return Ok(entry.token.clone());
        }

        let (token, expires_at) = sign_vapid_jwt(
            audience,
            &self.vapid.subject,
            &self.vapid.private_key_raw,
            VAPID_JWT_EXP_SECS,
        )?;
        self.jwt_cache.insert(
            audience.to_string(),
            CachedJwt {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }

    async fn post(&self, endpoint: &str, body: Vec<u8>, jwt: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(endpoint)
            .header("TTL", PUSH_TTL_SECS.to_string())
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("Urgency", "normal")
            .header(
                "Authorization",
                format!("vapid t={}, k={}", jwt, self.vapid.public_key_b64),
            )
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl PushRelay for WebPushRelay {
    fn name(&self) -> &'static str {
        "web_push"
    }

    async fn relay(
        &self,
        subscription: &PushSubscription,
        message: &PushMessage,
    ) -> Result<RelayReceipt> {
        let audience = push_service_audience(&subscription.endpoint)?;
        let jwt = self.vapid_jwt(&audience)?;

        let client_public: [u8; PUBLIC_KEY_LEN] = decode_b64url(&subscription.keys.p256dh)
            .map_err(|e| Error::push(format!("Invalid p256dh key: {}", e)))?
            .try_into()
            .map_err(|_| Error::push("Invalid p256dh key length"))?;
        let client_auth: [u8; AUTH_SECRET_LEN] = decode_b64url(&subscription.keys.auth)
            .map_err(|e| Error::push(format!("Invalid auth secret: {}", e)))?
            .try_into()
            .map_err(|_| Error::push("Invalid auth secret length"))?;

        let plaintext = capped_payload(message)?;
        let body = encrypt_payload(&plaintext, &client_public, &client_auth)?;

        let mut response = self.post(&subscription.endpoint, body.clone(), &jwt).await?;

        if response.status().as_u16() == 429
            && let Some(delay) = retry_after(&response)
            && delay <= MAX_RETRY_AFTER
        {
            debug!(?delay, "Push service throttled, retrying once");
            tokio::time::sleep(delay).await;
            response = self.post(&subscription.endpoint, body, &jwt).await?;
        }

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("Location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Ok(RelayReceipt {
                success: true,
                message_id,
                timestamp: Some(Utc::now().to_rfc3339()),
            });
        }

        if status.as_u16() == 404 || status.as_u16() == 410 {
            info!(endpoint = %subscription.endpoint, %status, "Push subscription expired");
            return Err(Error::not_found("push_subscription", &subscription.endpoint));
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read response body>".to_string());
        warn!(endpoint = %subscription.endpoint, %status, "Web push rejected");
        Err(Error::push(format!(
            "Web push failed: status {} body {}",
            status,
            truncate(&text, 500)
        )))
    }
}

/// JSON payload, shrunk to fit a single record.
fn capped_payload(message: &PushMessage) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Payload {
        title: String,
        body: String,
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    }

    let full = serde_json::to_vec(&Payload {
        title: truncate(&message.title, 120),
        body: truncate(&message.body, 600),
        data: message.data.clone(),
    })?;
    if full.len() <= MAX_PAYLOAD_BYTES {
        return Ok(full);
    }

    Ok(serde_json::to_vec(&Payload {
        title: truncate(&message.title, 80),
        body: truncate(&message.body, 200),
        data: serde_json::Value::Null,
    })?)
}

fn push_service_audience(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint).map_err(|e| Error::push(format!("Invalid push endpoint: {}", e)))?;
    let host = match url.host() {
        Some(url::Host::Domain(d)) => d.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => format!("[{}]", ip),
        None => return Err(Error::push("Push endpoint missing host")),
    };
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get("Retry-After")?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let mut out: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

pub(crate) fn decode_b64url(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.as_bytes())
}

pub(crate) fn encode_b64url(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::push("HKDF expand failed"))?;
    Ok(okm)
}

/// Content encryption key and nonce for one message.
struct ContentKeys {
    cipher: Aes128Gcm,
    nonce: [u8; 12],
}

fn derive_content_keys(
    shared_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> Result<ContentKeys> {
    let mut key_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + PUBLIC_KEY_LEN * 2);
    key_info.extend_from_slice(IKM_INFO_PREFIX);
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let ikm = hkdf_sha256(auth_secret, shared_secret, &key_info, 32)?;
    let cek = hkdf_sha256(salt, &ikm, KEY_INFO, 16)?;
    let nonce: [u8; 12] = hkdf_sha256(salt, &ikm, NONCE_INFO, 12)?
        .try_into()
        .map_err(|_| Error::push("Invalid nonce length"))?;

    let cipher =
        Aes128Gcm::new_from_slice(&cek).map_err(|_| Error::push("Invalid content key length"))?;
    Ok(ContentKeys { cipher, nonce })
}

/// Encrypt `plaintext` for a user agent as a single `aes128gcm` record.
pub(crate) fn encrypt_payload(
    plaintext: &[u8],
    ua_public: &[u8; PUBLIC_KEY_LEN],
    auth_secret: &[u8; AUTH_SECRET_LEN],
) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(Error::push("Web push payload cannot be empty"));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let remote = p256::PublicKey::from_sec1_bytes(ua_public)
        .map_err(|_| Error::push("Invalid user agent public key"))?;
    let local_secret = EphemeralSecret::random(&mut OsRng);
    let local_public = p256::PublicKey::from(&local_secret).to_encoded_point(false);
    let local_public = local_public.as_bytes();

    let shared = local_secret.diffie_hellman(&remote);
    let keys = derive_content_keys(
        shared.raw_secret_bytes().as_slice(),
        auth_secret,
        ua_public,
        local_public,
        &salt,
    )?;

    let mut padded = Vec::with_capacity(plaintext.len() + 1);
    padded.extend_from_slice(plaintext);
    padded.push(LAST_RECORD_DELIMITER);

    // Single record, so the sequence number is zero and the IV is the nonce.
    let ciphertext = keys
        .cipher
        .encrypt((&keys.nonce).into(), padded.as_slice())
        .map_err(|_| Error::push("AES-GCM encryption failed"))?;

    let mut body = Vec::with_capacity(HEADER_LEN + local_public.len() + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(local_public.len() as u8);
    body.extend_from_slice(local_public);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

/// Decrypt a single-record `aes128gcm` body addressed to `ua_secret`.
pub(crate) fn decrypt_payload(
    body: &[u8],
    ua_secret: &p256::SecretKey,
    auth_secret: &[u8; AUTH_SECRET_LEN],
) -> Result<Vec<u8>> {
    if body.len() < HEADER_LEN {
        return Err(Error::push("Encrypted body is too short"));
    }
    let salt = &body[..SALT_LEN];
    let key_id_len = body[HEADER_LEN - 1] as usize;
    let key_id_end = HEADER_LEN + key_id_len;
    if body.len() <= key_id_end {
        return Err(Error::push("Encrypted body is truncated"));
    }
    let sender_public = &body[HEADER_LEN..key_id_end];
    let ciphertext = &body[key_id_end..];

    let sender = p256::PublicKey::from_sec1_bytes(sender_public)
        .map_err(|_| Error::push("Invalid sender public key"))?;
    let shared = p256::ecdh::diffie_hellman(ua_secret.to_nonzero_scalar(), sender.as_affine());
    let ua_public = ua_secret.public_key().to_encoded_point(false);

    let keys = derive_content_keys(
        shared.raw_secret_bytes().as_slice(),
        auth_secret,
        ua_public.as_bytes(),
        sender_public,
        salt,
    )?;
    let mut padded = keys
        .cipher
        .decrypt((&keys.nonce).into(), ciphertext)
        .map_err(|_| Error::push("AES-GCM decryption failed"))?;

    while padded.last() == Some(&0) {
        padded.pop();
    }
    match padded.pop() {
        Some(LAST_RECORD_DELIMITER) => Ok(padded),
        _ => Err(Error::push("Missing record delimiter")),
    }
}

fn sign_vapid_jwt(
    audience: &str,
    subject: &str,
    private_key_raw: &[u8; 32],
    lifetime_secs: i64,
) -> Result<(String, i64)> {
    #[derive(Serialize)]
    struct Claims<'a> {
        aud: &'a str,
        exp: i64,
        sub: &'a str,
    }

    let expires_at = (Utc::now() + chrono::Duration::seconds(lifetime_secs)).timestamp();
    let header = encode_b64url(br#"{"typ":"JWT","alg":"ES256"}"#);
    let claims = encode_b64url(&serde_json::to_vec(&Claims {
        aud: audience,
        exp: expires_at,
        sub: subject,
    })?);
    let signing_input = format!("{}.{}", header, claims);

    let key = SigningKey::from_bytes(private_key_raw.into())
        .map_err(|_| Error::push("Invalid VAPID private key"))?;
    let signature: p256::ecdsa::Signature = key.sign(signing_input.as_bytes());

    Ok((
        format!("{}.{}", signing_input, encode_b64url(&signature.to_bytes())),
        expires_at,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    fn vapid_keys() -> (String, String, SigningKey) {
        let key = SigningKey::random(&mut OsRng);
        let public = key.verifying_key().to_encoded_point(false);
        (
            encode_b64url(public.as_bytes()),
            encode_b64url(&key.to_bytes()),
            key,
        )
    }

    #[test]
    fn test_audience_is_origin() {
        assert_eq!(
            push_service_audience("https://fcm.googleapis.com/fcm/send/abc").unwrap(),
            "https://fcm.googleapis.com"
        );
        assert_eq!(
            push_service_audience("http://127.0.0.1:8080/push/1").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(push_service_audience("not a url").is_err());
    }

    #[test]
    fn test_vapid_config_validates_key_lengths() {
        let (public, private, _) = vapid_keys();
        assert!(VapidConfig::from_keys(&public, &private, "mailto:ops@example.org").is_ok());
        assert!(VapidConfig::from_keys(&public, "AAAA", "").is_err());
        assert!(VapidConfig::from_keys("AAAA", &private, "").is_err());
    }

    #[test]
    fn test_vapid_jwt_verifies_and_is_cached() {
        let (public, private, key) = vapid_keys();
        let relay =
            WebPushRelay::new(VapidConfig::from_keys(&public, &private, "mailto:a@b.c").unwrap())
                .unwrap();

        let token = relay.vapid_jwt("https://push.example.com").unwrap();
        assert_eq!(relay.vapid_jwt("https://push.example.com").unwrap(), token);

        let (signing_input, signature) = token.rsplit_once('.').unwrap();
        let signature = Signature::from_slice(&decode_b64url(signature).unwrap()).unwrap();
        VerifyingKey::from(&key)
            .verify(signing_input.as_bytes(), &signature)
            .unwrap();

        let claims = signing_input.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&decode_b64url(claims).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://push.example.com");
        assert_eq!(claims["sub"], "mailto:a@b.c");
    }

    #[test]
    fn test_encrypted_body_decrypts_for_recipient() {
        let ua_secret = p256::SecretKey::random(&mut OsRng);
        let ua_public: [u8; PUBLIC_KEY_LEN] = ua_secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .unwrap();
        let mut auth = [0u8; AUTH_SECRET_LEN];
        OsRng.fill_bytes(&mut auth);

        let body = encrypt_payload(br#"{"title":"Pickup Reminder"}"#, &ua_public, &auth).unwrap();
        assert_eq!(&body[SALT_LEN..SALT_LEN + 4], &RECORD_SIZE.to_be_bytes());
        assert_eq!(body[HEADER_LEN - 1] as usize, PUBLIC_KEY_LEN);

        let plain = decrypt_payload(&body, &ua_secret, &auth).unwrap();
        assert_eq!(plain, br#"{"title":"Pickup Reminder"}"#);

        let mut wrong_auth = auth;
        wrong_auth[0] ^= 0xff;
        assert!(decrypt_payload(&body, &ua_secret, &wrong_auth).is_err());
    }

    #[test]
    fn test_oversized_payload_drops_data() {
        let message = PushMessage::new(
            "Delivery Update",
            "status changed",
            serde_json::json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES)}),
        );
        let bytes = capped_payload(&message).unwrap();
        assert!(bytes.len() <= MAX_PAYLOAD_BYTES);
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("data").is_none());
        assert_eq!(value["title"], "Delivery Update");
    }
}
