//! Local rendering: in-process toasts and native desktop notifications.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::capability::{CapabilityProbe, NotificationPermission};
use crate::Result;

/// Toasts kept for inspection.
const TOAST_HISTORY: usize = 64;
const TOAST_BROADCAST_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    #[default]
    Default,
    Destructive,
}

/// An in-process toast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
    pub created_at: DateTime<Utc>,
}

impl Toast {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            variant: ToastVariant::Default,
            created_at: Utc::now(),
        }
    }

    pub fn destructive(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            variant: ToastVariant::Destructive,
            ..Self::new(title, description)
        }
    }
}

/// Toast sink: broadcasts every toast and keeps a bounded history.
pub struct ToastCenter {
    tx: broadcast::Sender<Toast>,
    history: Mutex<VecDeque<Toast>>,
}

impl Default for ToastCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToastCenter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TOAST_BROADCAST_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(TOAST_HISTORY)),
        }
    }

    pub fn show(&self, toast: Toast) {
        debug!(title = %toast.title, variant = ?toast.variant, "Toast");
        {
            let mut history = self.history.lock();
            if history.len() == TOAST_HISTORY {
                history.pop_front();
            }
            history.push_back(toast.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(toast);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> {
        self.tx.subscribe()
    }

    /// Recent toasts, oldest first.
    pub fn recent(&self) -> Vec<Toast> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Toast> {
        self.history.lock().back().cloned()
    }
}

/// Platform notification primitive.
#[async_trait]
pub trait NativeNotifier: Send + Sync {
    async fn show(&self, title: &str, body: &str) -> Result<()>;
}

/// How a local notification ended up being shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderedVia {
    Native,
    Toast,
}

/// Renders notifications without any network round trip.
///
/// Uses the native notifier when permission is granted and one is installed,
/// otherwise (or when the native call fails) shows a toast.
pub struct LocalNotifier {
    toasts: Arc<ToastCenter>,
    native: Option<Arc<dyn NativeNotifier>>,
    probe: Arc<dyn CapabilityProbe>,
}

impl LocalNotifier {
    pub fn new(
        toasts: Arc<ToastCenter>,
        native: Option<Arc<dyn NativeNotifier>>,
        probe: Arc<dyn CapabilityProbe>,
    ) -> Self {
        Self {
            toasts,
            native,
            probe,
        }
    }

    pub fn toasts(&self) -> &Arc<ToastCenter> {
        &self.toasts
    }

    /// Show a status toast (confirmations and errors).
    pub fn toast(&self, toast: Toast) {
        self.toasts.show(toast);
    }

    pub async fn render(&self, title: &str, body: &str) -> RenderedVia {
        let permission = self.probe.probe().notification_permission;
        if permission == NotificationPermission::Granted
            && let Some(native) = &self.native
        {
            match native.show(title, body).await {
                Ok(()) => return RenderedVia::Native,
                Err(e) => warn!(error = %e, "Native notification failed, showing toast"),
            }
        }

        self.toasts.show(Toast::new(title, body));
        RenderedVia::Toast
    }
}

/// Desktop notifications through `notify-rust`.
#[cfg(feature = "desktop")]
pub struct DesktopNotifier {
    app_name: String,
}

#[cfg(feature = "desktop")]
impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

#[cfg(feature = "desktop")]
#[async_trait]
impl NativeNotifier for DesktopNotifier {
    async fn show(&self, title: &str, body: &str) -> Result<()> {
        let title = title.to_owned();
        let body = body.to_owned();
        let app_name = self.app_name.clone();

        // notify-rust blocks on the platform bus.
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .appname(&app_name)
                .summary(&title)
                .body(&body)
                .show()
                .map_err(|e| crate::Error::Other(format!("Desktop notification failed: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| crate::Error::Other(format!("Notification task failed: {}", e)))?
    }
}
