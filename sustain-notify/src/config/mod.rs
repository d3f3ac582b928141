//! Pipeline configuration.
//!
//! Loaded from a TOML file ([`NotifyConfig::load_file`]) or from environment
//! variables ([`NotifyConfig::from_env`]). Every field has a default, so a
//! file only needs the settings it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use realtime_channel::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::notification::capability::NotificationPermission;
use crate::{Error, Result};

/// Realtime protocol version appended to the socket URL.
const REALTIME_VSN: &str = "1.0.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub backend: BackendConfig,
    /// Current user; owns the push subscription and the realtime topic.
    pub user_id: String,
    pub scheduler: SchedulerSettings,
    pub realtime: RealtimeSettings,
    pub push: PushSettings,
    /// Local notification permission at startup.
    pub permission: NotificationPermission,
    pub preferences: Preferences,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend (REST, functions and realtime live under it).
    pub url: String,
    /// Public API key sent with every request.
    pub anon_key: String,
    /// User access token; the API key is used as bearer when absent.
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
    /// Delivered items kept for inspection.
    pub audit_retention: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            audit_retention: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub enabled: bool,
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Zero disables heartbeats.
    pub heartbeat_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reconnect_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            heartbeat_secs: 30,
        }
    }
}

/// Which relay carries push messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// The backend's `send-push-notification` function.
    #[default]
    EdgeFunction,
    /// Straight to the push service with VAPID.
    WebPush,
}

impl std::str::FromStr for RelayMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge_function" | "edge-function" | "edge" => Ok(Self::EdgeFunction),
            "web_push" | "web-push" | "webpush" => Ok(Self::WebPush),
            other => Err(Error::config(format!("unknown push relay '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Push service endpoint for this device. Push is unsupported without one.
    pub device_endpoint: Option<String>,
    pub relay: RelayMode,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_subject: String,
    /// JSON file holding this device's push keys, so a subscription outlives
    /// the process. In memory when unset.
    pub key_file: Option<PathBuf>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            device_endpoint: None,
            relay: RelayMode::EdgeFunction,
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_subject: "mailto:admin@localhost".to_string(),
            key_file: None,
        }
    }
}

/// User notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub push_enabled: bool,
    pub delivery_updates: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            push_enabled: true,
            delivery_updates: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Push relays allowed per window.
    pub limit: u32,
    pub window_secs: u64,
    /// JSON file holding the counters; in memory when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 60,
            window_secs: 60,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    /// Filter directive applied after startup, e.g. `sustain_notify=debug`.
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            filter: None,
        }
    }
}

impl NotifyConfig {
    /// Load a TOML file and validate it.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (after `.env`), falling back to defaults.
    ///
    /// Supported env vars:
    /// - `SUSTAIN_BACKEND_URL`, `SUSTAIN_ANON_KEY`, `SUSTAIN_ACCESS_TOKEN`, `SUSTAIN_USER_ID`
    /// - `SUSTAIN_POLL_INTERVAL_SECS`
    /// - `SUSTAIN_REALTIME_ENABLED`, `SUSTAIN_REALTIME_MAX_ATTEMPTS`, `SUSTAIN_REALTIME_HEARTBEAT_SECS`
    /// - `SUSTAIN_PUSH_ENDPOINT`, `SUSTAIN_PUSH_RELAY`, `SUSTAIN_PUSH_KEY_FILE`
    /// - `WEB_PUSH_VAPID_PUBLIC_KEY`, `WEB_PUSH_VAPID_PRIVATE_KEY`, `WEB_PUSH_VAPID_SUBJECT`
    /// - `SUSTAIN_NOTIFICATION_PERMISSION`, `SUSTAIN_PUSH_ENABLED`, `SUSTAIN_DELIVERY_UPDATES`
    /// - `SUSTAIN_RATE_LIMIT`, `SUSTAIN_RATE_LIMIT_WINDOW_SECS`, `SUSTAIN_RATE_LIMIT_STATE`
    /// - `SUSTAIN_LOG_DIR`, `SUSTAIN_LOG_FILTER`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an arbitrary variable source. Does not validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = var("SUSTAIN_BACKEND_URL") {
            config.backend.url = url;
        }
        if let Some(key) = var("SUSTAIN_ANON_KEY") {
            config.backend.anon_key = key;
        }
        config.backend.access_token = var("SUSTAIN_ACCESS_TOKEN");
        if let Some(user_id) = var("SUSTAIN_USER_ID") {
            config.user_id = user_id;
        }

        if let Some(secs) = var("SUSTAIN_POLL_INTERVAL_SECS") {
            config.scheduler.poll_interval_secs = parse_var("SUSTAIN_POLL_INTERVAL_SECS", &secs)?;
        }

        if let Some(enabled) = var("SUSTAIN_REALTIME_ENABLED") {
            config.realtime.enabled = parse_bool("SUSTAIN_REALTIME_ENABLED", &enabled)?;
        }
        if let Some(attempts) = var("SUSTAIN_REALTIME_MAX_ATTEMPTS") {
            config.realtime.max_reconnect_attempts =
                parse_var("SUSTAIN_REALTIME_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(secs) = var("SUSTAIN_REALTIME_HEARTBEAT_SECS") {
            config.realtime.heartbeat_secs = parse_var("SUSTAIN_REALTIME_HEARTBEAT_SECS", &secs)?;
        }

        config.push.device_endpoint = var("SUSTAIN_PUSH_ENDPOINT");
        if let Some(relay) = var("SUSTAIN_PUSH_RELAY") {
            config.push.relay = relay.parse()?;
        }
        config.push.key_file = var("SUSTAIN_PUSH_KEY_FILE").map(PathBuf::from);
        config.push.vapid_public_key = var("WEB_PUSH_VAPID_PUBLIC_KEY");
        config.push.vapid_private_key = var("WEB_PUSH_VAPID_PRIVATE_KEY");
        if let Some(subject) = var("WEB_PUSH_VAPID_SUBJECT") {
            config.push.vapid_subject = subject;
        }

        if let Some(permission) = var("SUSTAIN_NOTIFICATION_PERMISSION") {
            config.permission = permission.parse()?;
        }
        if let Some(enabled) = var("SUSTAIN_PUSH_ENABLED") {
            config.preferences.push_enabled = parse_bool("SUSTAIN_PUSH_ENABLED", &enabled)?;
        }
        if let Some(enabled) = var("SUSTAIN_DELIVERY_UPDATES") {
            config.preferences.delivery_updates = parse_bool("SUSTAIN_DELIVERY_UPDATES", &enabled)?;
        }

        if let Some(limit) = var("SUSTAIN_RATE_LIMIT") {
            config.rate_limit.limit = parse_var("SUSTAIN_RATE_LIMIT", &limit)?;
        }
        if let Some(secs) = var("SUSTAIN_RATE_LIMIT_WINDOW_SECS") {
            config.rate_limit.window_secs = parse_var("SUSTAIN_RATE_LIMIT_WINDOW_SECS", &secs)?;
        }
        config.rate_limit.state_file = var("SUSTAIN_RATE_LIMIT_STATE").map(PathBuf::from);

        if let Some(dir) = var("SUSTAIN_LOG_DIR") {
            config.logging.dir = dir;
        }
        config.logging.filter = var("SUSTAIN_LOG_FILTER");

        Ok(config)
    }

    /// Reject contradictory or unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::config("user_id is required"));
        }
        if self.backend.url.trim().is_empty() {
            return Err(Error::config("backend.url is required"));
        }
        let backend = Url::parse(&self.backend.url)
            .map_err(|e| Error::config(format!("invalid backend.url: {}", e)))?;
        if !matches!(backend.scheme(), "http" | "https") {
            return Err(Error::config("backend.url must be http or https"));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(Error::config("scheduler.poll_interval_secs must be positive"));
        }
        if self.realtime.base_delay_ms == 0 || self.realtime.max_delay_ms < self.realtime.base_delay_ms {
            return Err(Error::config(
                "realtime.max_delay_ms must be at least realtime.base_delay_ms (> 0)",
            ));
        }
        if let Some(endpoint) = &self.push.device_endpoint {
            Url::parse(endpoint)
                .map_err(|e| Error::config(format!("invalid push.device_endpoint: {}", e)))?;
        }
        if self.push.relay == RelayMode::WebPush
            && (self.push.vapid_public_key.is_none() || self.push.vapid_private_key.is_none())
        {
            return Err(Error::config(
                "push.relay = web_push requires vapid_public_key and vapid_private_key",
            ));
        }
        if self.rate_limit.limit == 0 || self.rate_limit.window_secs == 0 {
            return Err(Error::config("rate_limit.limit and window_secs must be positive"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.realtime.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.realtime.base_delay_ms),
            max_delay: Duration::from_millis(self.realtime.max_delay_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.realtime.heartbeat_secs)
    }

    pub fn has_push_endpoint(&self) -> bool {
        self.push.device_endpoint.is_some()
    }

    pub fn has_realtime(&self) -> bool {
        self.realtime.enabled && !self.backend.url.trim().is_empty()
    }

    /// Realtime socket URL derived from the backend URL:
    /// `wss://<host>/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`.
    pub fn realtime_url(&self) -> Result<String> {
        let backend = Url::parse(&self.backend.url)
            .map_err(|e| Error::config(format!("invalid backend.url: {}", e)))?;
        let scheme = match backend.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(Error::config(format!(
                    "cannot derive realtime URL from scheme '{}'",
                    other
                )));
            }
        };
        let host = backend
            .host_str()
            .ok_or_else(|| Error::config("backend.url has no host"))?;
        let authority = match backend.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let url = Url::parse_with_params(
            &format!("{}://{}/realtime/v1/websocket", scheme, authority),
            &[
                ("apikey", self.backend.anon_key.as_str()),
                ("vsn", REALTIME_VSN),
            ],
        )
        .map_err(|e| Error::config(format!("invalid realtime URL: {}", e)))?;
        Ok(url.into())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid value for {}: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("invalid boolean for {}: '{}'", key, value))),
    }
}
