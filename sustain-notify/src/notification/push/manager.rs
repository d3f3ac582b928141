//! Push subscription lifecycle.
//!
//! The manager is the only writer of the user's subscription, both the local
//! registration and the remote row. A subscription counts as active only
//! when both sides agree. Changes to that are published on a watch channel
//! so the pipeline can switch the realtime fallback on and off.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::registrar::PushRegistrar;
use super::store::SubscriptionStore;
use super::subscription::{PushSubscription, PushSubscriptionRecord};
use crate::notification::capability::{CapabilityProbe, NotificationPermission};
use crate::notification::toast::{LocalNotifier, RenderedVia, Toast};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct PushState {
    subscription: Option<PushSubscription>,
    /// Remote row known to exist.
    remote_confirmed: bool,
}

impl PushState {
    fn is_active(&self) -> bool {
        self.subscription.is_some() && self.remote_confirmed
    }
}

/// Result of a best-effort unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeOutcome {
    pub local_removed: bool,
    pub remote_removed: bool,
}

impl UnsubscribeOutcome {
    pub fn is_complete(&self) -> bool {
        self.local_removed && self.remote_removed
    }
}

pub struct PushSubscriptionManager {
    user_id: String,
    probe: Arc<dyn CapabilityProbe>,
    registrar: Arc<dyn PushRegistrar>,
    store: Arc<dyn SubscriptionStore>,
    notifier: Arc<LocalNotifier>,
    application_server_key: Option<String>,
    state: RwLock<PushState>,
    active_tx: watch::Sender<bool>,
}

impl PushSubscriptionManager {
    pub fn new(
        user_id: impl Into<String>,
        probe: Arc<dyn CapabilityProbe>,
        registrar: Arc<dyn PushRegistrar>,
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<LocalNotifier>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            probe,
            registrar,
            store,
            notifier,
            application_server_key: None,
            state: RwLock::new(PushState::default()),
            active_tx: watch::channel(false).0,
        }
    }

    /// VAPID public key passed to the registrar.
    pub fn with_application_server_key(mut self, key: Option<String>) -> Self {
        self.application_server_key = key;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_supported(&self) -> bool {
        self.probe.probe().has_push
    }

    /// Subscribed both locally and remotely.
    pub fn has_active_subscription(&self) -> bool {
        self.state.read().is_active()
    }

    /// Watch [`has_active_subscription`](Self::has_active_subscription).
    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.active_tx.subscribe()
    }

    fn set_state(&self, state: PushState) {
        let active = state.is_active();
        *self.state.write() = state;
        self.active_tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    pub fn is_subscribed(&self) -> bool {
        self.has_active_subscription()
    }

    /// Current subscription, only when active.
    pub fn active_subscription(&self) -> Option<PushSubscription> {
        let state = self.state.read();
        if state.remote_confirmed {
            state.subscription.clone()
        } else {
            None
        }
    }

    /// Ask for notification permission, reporting the outcome with a toast.
    pub fn request_permission(&self) -> NotificationPermission {
        if !self.is_supported() {
            self.notifier.toast(Toast::destructive(
                "Not Supported",
                "Push notifications are not supported in this browser",
            ));
            return NotificationPermission::Denied;
        }

        let permission = self.probe.request_permission();
        if permission == NotificationPermission::Granted {
            self.notifier.toast(Toast::new(
                "Notifications Enabled",
                "You'll receive updates about your deliveries",
            ));
        } else {
            self.notifier.toast(Toast::destructive(
                "Permission Denied",
                "Please enable notifications in your browser settings",
            ));
        }
        permission
    }

    /// Register a subscription and persist it for this user.
    ///
    /// Never retries. On any failure a toast is shown and the manager stays
    /// unsubscribed; a registration whose persistence failed is rolled back.
    pub async fn subscribe(&self) -> Result<PushSubscription> {
        let caps = self.probe.probe();
        if !caps.has_push {
            self.notifier.toast(Toast::destructive(
                "Not Supported",
                "Push notifications are not supported in this browser",
            ));
            return Err(Error::PushUnsupported);
        }
        if caps.notification_permission != NotificationPermission::Granted {
            self.notifier.toast(Toast::destructive(
                "Permission Denied",
                "Please enable notifications in your browser settings",
            ));
            return Err(Error::PermissionDenied);
        }
        if self.user_id.is_empty() {
            return Err(self.subscription_failed(Error::validation(
                "cannot subscribe without a user",
            )));
        }

        let subscription = match self
            .registrar
            .subscribe(self.application_server_key.as_deref())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "Push registration failed");
                return Err(self.subscription_failed(e));
            }
        };

        if let Err(e) = self.persist(&subscription).await {
            error!(error = %e, user_id = %self.user_id, "Failed to persist push subscription");
            if let Err(rollback) = self.registrar.unsubscribe().await {
                warn!(error = %rollback, "Failed to roll back push registration");
            }
            self.set_state(PushState::default());
            return Err(self.subscription_failed(e));
        }

        self.set_state(PushState {
            subscription: Some(subscription.clone()),
            remote_confirmed: true,
        });
        info!(user_id = %self.user_id, endpoint = %subscription.endpoint, "Subscribed to push notifications");
        self.notifier.toast(Toast::new(
            "Subscribed",
            "You'll receive push notifications for delivery updates",
        ));
        Ok(subscription)
    }

    async fn persist(&self, subscription: &PushSubscription) -> Result<()> {
        let record = PushSubscriptionRecord::new(&self.user_id, subscription)?;
        self.store.upsert(&record).await
    }

    fn subscription_failed(&self, e: Error) -> Error {
        self.notifier.toast(Toast::destructive(
            "Subscription Failed",
            "Failed to enable push notifications",
        ));
        e
    }

    /// Remove the local registration, then the remote row.
    ///
    /// Returns `None` without touching anything when there is no
    /// subscription. Otherwise each step is attempted regardless of the
    /// other; failures are logged and reported in the outcome, never rolled
    /// back.
    pub async fn unsubscribe(&self) -> Option<UnsubscribeOutcome> {
        let known = self.state.read().subscription.is_some();
        if !known && self.registrar.current().await.is_none() {
            debug!(user_id = %self.user_id, "No push subscription to remove");
            return None;
        }

        let local_removed = match self.registrar.unsubscribe().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Local push unsubscribe failed");
                false
            }
        };
        self.set_state(PushState::default());

        let remote_removed = match self.store.delete(&self.user_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, user_id = %self.user_id, "Remote push subscription delete failed");
                false
            }
        };

        let outcome = UnsubscribeOutcome {
            local_removed,
            remote_removed,
        };
        if outcome.is_complete() {
            info!(user_id = %self.user_id, "Unsubscribed from push notifications");
            self.notifier.toast(Toast::new(
                "Unsubscribed",
                "Push notifications have been disabled",
            ));
        } else {
            self.notifier.toast(Toast::destructive(
                "Error",
                "Failed to disable push notifications",
            ));
        }
        Some(outcome)
    }

    /// Rebuild state from an existing registration and remote row.
    ///
    /// A remote row without a local registration can never be delivered to
    /// and is deleted.
    pub async fn restore(&self) -> bool {
        if !self.is_supported() {
            return false;
        }
        let Some(subscription) = self.registrar.current().await else {
            self.drop_orphaned_row().await;
            return false;
        };

        let remote_confirmed = match self.store.exists(&self.user_id).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(error = %e, "Could not confirm remote push subscription");
                false
            }
        };
        self.set_state(PushState {
            subscription: Some(subscription),
            remote_confirmed,
        });
        remote_confirmed
    }

    async fn drop_orphaned_row(&self) {
        match self.store.exists(&self.user_id).await {
            Ok(true) => match self.store.delete(&self.user_id).await {
                Ok(()) => info!(user_id = %self.user_id, "Removed push subscription without local keys"),
                Err(e) => warn!(error = %e, "Failed to remove orphaned push subscription"),
            },
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Could not check for orphaned push subscription"),
        }
    }

    /// Drop a subscription the push service reported as gone.
    pub async fn forget_expired(&self) {
        self.set_state(PushState::default());
        if let Err(e) = self.registrar.unsubscribe().await {
            warn!(error = %e, "Failed to drop expired push registration");
        }
        if let Err(e) = self.store.delete(&self.user_id).await {
            warn!(error = %e, "Failed to delete expired push subscription");
        }
        info!(user_id = %self.user_id, "Removed expired push subscription");
    }

    /// Show a local test notification.
    pub async fn send_test_notification(&self) -> Option<RenderedVia> {
        if !self.is_supported() {
            return None;
        }
        Some(
            self.notifier
                .render(
                    "Test Notification",
                    "This is a test notification from SustainConnect",
                )
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::capability::ConfiguredProbe;
    use crate::notification::push::registrar::KeypairRegistrar;
    use crate::notification::push::store::MemorySubscriptionStore;
    use crate::notification::toast::{ToastCenter, ToastVariant};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore;

    #[async_trait]
    impl SubscriptionStore for FailingStore {
        async fn upsert(&self, _record: &PushSubscriptionRecord) -> Result<()> {
            Err(Error::Other("database unavailable".to_string()))
        }

        async fn delete(&self, _user_id: &str) -> Result<()> {
            Err(Error::Other("database unavailable".to_string()))
        }

        async fn exists(&self, _user_id: &str) -> Result<bool> {
            Err(Error::Other("database unavailable".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingRegistrar {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PushRegistrar for CountingRegistrar {
        async fn subscribe(&self, _key: Option<&str>) -> Result<PushSubscription> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::push("unreachable"))
        }

        async fn current(&self) -> Option<PushSubscription> {
            None
        }

        async fn unsubscribe(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn manager_with(
        probe: ConfiguredProbe,
        registrar: Arc<dyn PushRegistrar>,
        store: Arc<dyn SubscriptionStore>,
    ) -> (PushSubscriptionManager, Arc<ToastCenter>) {
        let probe: Arc<dyn CapabilityProbe> = Arc::new(probe);
        let toasts = Arc::new(ToastCenter::new());
        let notifier = Arc::new(LocalNotifier::new(toasts.clone(), None, probe.clone()));
        (
            PushSubscriptionManager::new("user-1", probe, registrar, store, notifier),
            toasts,
        )
    }

    fn granted() -> ConfiguredProbe {
        ConfiguredProbe::new(true, true, NotificationPermission::Granted)
    }

    #[tokio::test]
    async fn test_unsupported_never_contacts_registrar() {
        let registrar = Arc::new(CountingRegistrar::default());
        let (manager, toasts) = manager_with(
            ConfiguredProbe::new(false, true, NotificationPermission::Granted),
            registrar.clone(),
            Arc::new(MemorySubscriptionStore::new()),
        );

        assert!(matches!(
            manager.subscribe().await,
            Err(Error::PushUnsupported)
        ));
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
        let toast = toasts.last().unwrap();
        assert_eq!(toast.title, "Not Supported");
        assert_eq!(toast.variant, ToastVariant::Destructive);
    }

    #[tokio::test]
    async fn test_subscribe_requires_permission() {
        let registrar = Arc::new(CountingRegistrar::default());
        let (manager, toasts) = manager_with(
            ConfiguredProbe::new(true, true, NotificationPermission::Default),
            registrar.clone(),
            Arc::new(MemorySubscriptionStore::new()),
        );
        assert!(matches!(
            manager.subscribe().await,
            Err(Error::PermissionDenied)
        ));
        assert_eq!(registrar.calls.load(Ordering::SeqCst), 0);
        assert_eq!(toasts.last().unwrap().title, "Permission Denied");
    }

    #[tokio::test]
    async fn test_subscribe_persists_and_activates() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let (manager, toasts) = manager_with(
            granted(),
            Arc::new(KeypairRegistrar::new("https://push.example.com/send")),
            store.clone(),
        );

        let sub = manager.subscribe().await.unwrap();
        assert!(manager.has_active_subscription());
        assert_eq!(manager.active_subscription(), Some(sub.clone()));
        assert_eq!(store.get("user-1").unwrap().subscription().unwrap(), sub);
        assert_eq!(toasts.last().unwrap().title, "Subscribed");
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_no_ghost_subscription() {
        let registrar = Arc::new(KeypairRegistrar::new("https://push.example.com/send"));
        let (manager, toasts) = manager_with(granted(), registrar.clone(), Arc::new(FailingStore));

        assert!(manager.subscribe().await.is_err());
        assert!(!manager.is_subscribed());
        assert!(manager.active_subscription().is_none());
        assert!(registrar.current().await.is_none());

        let toast = toasts.last().unwrap();
        assert_eq!(toast.title, "Subscription Failed");
        assert_eq!(toast.variant, ToastVariant::Destructive);
    }

    #[tokio::test]
    async fn test_unsubscribe_partial_failure_is_reported() {
        let registrar = Arc::new(KeypairRegistrar::new("https://push.example.com/send"));
        let (manager, toasts) = manager_with(granted(), registrar.clone(), Arc::new(FailingStore));
        registrar.subscribe(None).await.unwrap();

        let outcome = manager.unsubscribe().await.unwrap();
        assert!(outcome.local_removed);
        assert!(!outcome.remote_removed);
        assert!(registrar.current().await.is_none());
        assert!(!manager.is_subscribed());
        assert_eq!(toasts.last().unwrap().title, "Error");
    }

    #[tokio::test]
    async fn test_restore_requires_remote_row() {
        let registrar = Arc::new(KeypairRegistrar::new("https://push.example.com/send"));
        let store = Arc::new(MemorySubscriptionStore::new());
        let (manager, _) = manager_with(granted(), registrar.clone(), store.clone());

        registrar.subscribe(None).await.unwrap();
        assert!(!manager.restore().await);
        assert!(!manager.has_active_subscription());

        let sub = registrar.current().await.unwrap();
        store
            .upsert(&PushSubscriptionRecord::new("user-1", &sub).unwrap())
            .await
            .unwrap();
        assert!(manager.restore().await);
        assert!(manager.has_active_subscription());
    }

    #[tokio::test]
    async fn test_restore_deletes_row_without_local_keys() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let previous = KeypairRegistrar::new("https://push.example.com/send")
            .subscribe(None)
            .await
            .unwrap();
        store
            .upsert(&PushSubscriptionRecord::new("user-1", &previous).unwrap())
            .await
            .unwrap();

        let (manager, _) = manager_with(
            granted(),
            Arc::new(KeypairRegistrar::new("https://push.example.com/send")),
            store.clone(),
        );
        assert!(!manager.restore().await);
        assert!(!store.exists("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription_is_a_no_op() {
        let store = Arc::new(MemorySubscriptionStore::new());
        let (manager, toasts) = manager_with(
            granted(),
            Arc::new(KeypairRegistrar::new("https://push.example.com/send")),
            store.clone(),
        );

        assert!(manager.unsubscribe().await.is_none());
        assert!(toasts.last().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_without_user_shows_failure_toast() {
        let probe: Arc<dyn CapabilityProbe> = Arc::new(granted());
        let toasts = Arc::new(ToastCenter::new());
        let notifier = Arc::new(LocalNotifier::new(toasts.clone(), None, probe.clone()));
        let manager = PushSubscriptionManager::new(
            "",
            probe,
            Arc::new(CountingRegistrar::default()),
            Arc::new(MemorySubscriptionStore::new()),
            notifier,
        );

        assert!(matches!(manager.subscribe().await, Err(Error::Validation(_))));
        let toast = toasts.last().unwrap();
        assert_eq!(toast.title, "Subscription Failed");
        assert_eq!(toast.variant, ToastVariant::Destructive);
    }

    #[tokio::test]
    async fn test_active_state_is_published() {
        let (manager, _) = manager_with(
            granted(),
            Arc::new(KeypairRegistrar::new("https://push.example.com/send")),
            Arc::new(MemorySubscriptionStore::new()),
        );
        let mut active = manager.watch_active();
        assert!(!*active.borrow());

        manager.subscribe().await.unwrap();
        assert!(active.has_changed().unwrap());
        assert!(*active.borrow_and_update());

        manager.forget_expired().await;
        assert!(active.has_changed().unwrap());
        assert!(!*active.borrow_and_update());
    }

    #[tokio::test]
    async fn test_request_permission_toasts() {
        let (manager, toasts) = manager_with(
            ConfiguredProbe::new(true, true, NotificationPermission::Default)
                .with_prompt_answer(NotificationPermission::Denied),
            Arc::new(CountingRegistrar::default()),
            Arc::new(MemorySubscriptionStore::new()),
        );
        assert_eq!(manager.request_permission(), NotificationPermission::Denied);
        assert_eq!(toasts.last().unwrap().title, "Permission Denied");

        let (manager, toasts) = manager_with(
            ConfiguredProbe::new(true, true, NotificationPermission::Default),
            Arc::new(CountingRegistrar::default()),
            Arc::new(MemorySubscriptionStore::new()),
        );
        assert_eq!(manager.request_permission(), NotificationPermission::Granted);
        assert_eq!(toasts.last().unwrap().title, "Notifications Enabled");
    }

    #[tokio::test]
    async fn test_send_test_notification_renders_locally() {
        let (manager, toasts) = manager_with(
            ConfiguredProbe::new(true, false, NotificationPermission::Default),
            Arc::new(CountingRegistrar::default()),
            Arc::new(MemorySubscriptionStore::new()),
        );
        assert_eq!(
            manager.send_test_notification().await,
            Some(RenderedVia::Toast)
        );
        assert_eq!(toasts.last().unwrap().title, "Test Notification");
    }
}
