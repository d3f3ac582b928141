//! Channel selection and delivery of due notifications.
//!
//! Precedence, first applicable wins:
//! 1. push, when enabled and the user has an active subscription
//! 2. local rendering while the realtime channel is connected
//! 3. local rendering otherwise
//!
//! Scheduled reminders have no server-side counterpart, so paths 2 and 3
//! render the same way. Only the reported [`DeliveryChannel`] differs.

use std::sync::Arc;

use async_trait::async_trait;
use realtime_channel::{ConnectionStatus, DeliveryUpdate};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::kind::{NotificationText, ScheduledNotification};
use super::push::{PushMessage, PushRelay, PushSubscriptionManager, RelayReceipt};
use super::rate_limit::RateLimiter;
use super::toast::{LocalNotifier, RenderedVia};
use crate::config::Preferences;
use crate::{Error, Result};

/// Rate limiter key for push relay requests.
pub const PUSH_RATE_LIMIT_KEY: &str = "push_relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Push,
    /// Rendered locally with the realtime channel connected.
    RealtimeLocal,
    LocalToast,
}

impl std::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::RealtimeLocal => write!(f, "realtime_local"),
            Self::LocalToast => write!(f, "local_toast"),
        }
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub channel: DeliveryChannel,
    /// Set when the notification was rendered locally.
    pub rendered: Option<RenderedVia>,
    /// Set when a push relay acknowledged the message.
    pub receipt: Option<RelayReceipt>,
}

/// Delivers a due notification.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, notification: &ScheduledNotification) -> Result<DispatchOutcome>;
}

pub struct Dispatcher {
    push: Arc<PushSubscriptionManager>,
    relay: Option<Arc<dyn PushRelay>>,
    local: Arc<LocalNotifier>,
    realtime_status: Option<watch::Receiver<ConnectionStatus>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    preferences: Preferences,
}

impl Dispatcher {
    pub fn new(push: Arc<PushSubscriptionManager>, local: Arc<LocalNotifier>) -> Self {
        Self {
            push,
            relay: None,
            local,
            realtime_status: None,
            rate_limiter: None,
            preferences: Preferences::default(),
        }
    }

    /// Without a relay the push path is never taken.
    pub fn with_relay(mut self, relay: Arc<dyn PushRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_realtime_status(mut self, status: watch::Receiver<ConnectionStatus>) -> Self {
        self.realtime_status = Some(status);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn preferences(&self) -> Preferences {
        self.preferences
    }

    fn realtime_connected(&self) -> bool {
        self.realtime_status
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == ConnectionStatus::Connected)
    }

    fn local_channel(&self) -> DeliveryChannel {
        if self.realtime_connected() {
            DeliveryChannel::RealtimeLocal
        } else {
            DeliveryChannel::LocalToast
        }
    }

    /// Channel a notification dispatched now would take.
    pub fn select_channel(&self) -> DeliveryChannel {
        if self.preferences.push_enabled
            && self.relay.is_some()
            && self.push.has_active_subscription()
        {
            DeliveryChannel::Push
        } else {
            self.local_channel()
        }
    }

    async fn render_local(&self, text: &NotificationText) -> DispatchOutcome {
        let rendered = self.local.render(&text.title, &text.body).await;
        DispatchOutcome {
            channel: self.local_channel(),
            rendered: Some(rendered),
            receipt: None,
        }
    }

    /// Relay through push. `None` means the caller should render locally.
    async fn try_push(
        &self,
        notification: &ScheduledNotification,
        text: &NotificationText,
    ) -> Option<RelayReceipt> {
        let relay = self.relay.as_ref()?;
        let subscription = self.push.active_subscription()?;

        if let Some(limiter) = &self.rate_limiter
            && !limiter.consume(PUSH_RATE_LIMIT_KEY)
        {
            warn!(id = %notification.id, "Push relay rate limited, rendering locally");
            return None;
        }

        let message = PushMessage::new(&text.title, &text.body, notification.payload.data());
        match relay.relay(&subscription, &message).await {
            Ok(receipt) => {
                info!(
                    id = %notification.id,
                    kind = %notification.kind(),
                    relay = relay.name(),
                    message_id = ?receipt.message_id,
                    "Notification relayed via push"
                );
                Some(receipt)
            }
            Err(Error::NotFound { .. }) => {
                warn!(id = %notification.id, "Push subscription expired, rendering locally");
                self.push.forget_expired().await;
                None
            }
            Err(e) => {
                warn!(id = %notification.id, relay = relay.name(), error = %e, "Push relay failed, rendering locally");
                None
            }
        }
    }

    /// Render a server-originated delivery update. Returns `None` when the
    /// user turned delivery updates off.
    pub async fn render_realtime_update(&self, update: &DeliveryUpdate) -> Option<RenderedVia> {
        if !self.preferences.delivery_updates {
            debug!(status = ?update.status, "Delivery updates disabled, skipping");
            return None;
        }
        Some(self.local.render(&update.title, &update.message).await)
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, notification: &ScheduledNotification) -> Result<DispatchOutcome> {
        let text = notification.text();
        let channel = self.select_channel();
        debug!(id = %notification.id, kind = %notification.kind(), %channel, "Dispatching");

        if channel == DeliveryChannel::Push
            && let Some(receipt) = self.try_push(notification, &text).await
        {
            return Ok(DispatchOutcome {
                channel: DeliveryChannel::Push,
                rendered: None,
                receipt: Some(receipt),
            });
        }

        Ok(self.render_local(&text).await)
    }
}
