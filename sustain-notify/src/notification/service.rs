//! Pipeline assembly and lifecycle.
//!
//! [`NotificationPipeline`] owns one instance of every component, built once
//! at startup. `start` restores push state, brings up the realtime fallback
//! when push is not active, and starts the scheduler loop; `stop` tears all of
//! it down again. While running, losing the push subscription for any reason
//! brings the realtime fallback back up.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use realtime_channel::{RealtimeChannel, RealtimeConfig, RealtimeEvent, Transport, WsTransport};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capability::{Capabilities, CapabilityProbe, ConfiguredProbe};
use super::dispatcher::Dispatcher;
use super::push::{
    EdgeFunctionRelay, KeypairRegistrar, PushRegistrar, PushRelay, PushSubscription,
    PushSubscriptionManager, RestSubscriptionStore, SubscriptionStore, UnsubscribeOutcome,
    VapidConfig, WebPushRelay,
};
use super::rate_limit::RateLimiter;
use super::scheduler::{NotificationScheduler, SchedulerGuard};
use super::toast::{LocalNotifier, NativeNotifier, Toast, ToastCenter};
use crate::Result;
use crate::config::{NotifyConfig, RelayMode};

const CONNECTION_FAILED_TITLE: &str = "Connection Failed";
const CONNECTION_FAILED_BODY: &str =
    "Unable to maintain real-time connection. Some features may be limited.";

/// Builds a [`NotificationPipeline`] from configuration.
///
/// Every collaborator can be replaced; anything not supplied is derived from
/// the config.
pub struct PipelineBuilder {
    config: NotifyConfig,
    probe: Option<Arc<dyn CapabilityProbe>>,
    registrar: Option<Arc<dyn PushRegistrar>>,
    store: Option<Arc<dyn SubscriptionStore>>,
    relay: Option<Arc<dyn PushRelay>>,
    transport: Option<Arc<dyn Transport>>,
    native: Option<Arc<dyn NativeNotifier>>,
}

impl PipelineBuilder {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            probe: None,
            registrar: None,
            store: None,
            relay: None,
            transport: None,
            native: None,
        }
    }

    pub fn probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn PushRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn relay(mut self, relay: Arc<dyn PushRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn native_notifier(mut self, native: Arc<dyn NativeNotifier>) -> Self {
        self.native = Some(native);
        self
    }

    fn default_relay(config: &NotifyConfig) -> Result<Arc<dyn PushRelay>> {
        let relay: Arc<dyn PushRelay> = match config.push.relay {
            RelayMode::EdgeFunction => Arc::new(EdgeFunctionRelay::new(
                &config.backend.url,
                config.backend.anon_key.clone(),
                config.backend.access_token.clone(),
            )?),
            RelayMode::WebPush => {
                let vapid = VapidConfig::from_keys(
                    config.push.vapid_public_key.as_deref().unwrap_or_default(),
                    config.push.vapid_private_key.as_deref().unwrap_or_default(),
                    &config.push.vapid_subject,
                )?;
                Arc::new(WebPushRelay::new(vapid)?)
            }
        };
        Ok(relay)
    }

    pub fn build(self) -> Result<NotificationPipeline> {
        let config = self.config;
        config.validate()?;

        let probe: Arc<dyn CapabilityProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(ConfiguredProbe::new(
                config.has_push_endpoint(),
                config.has_realtime(),
                config.permission,
            )),
        };
        let caps = probe.probe();

        let toasts = Arc::new(ToastCenter::new());
        let local = Arc::new(LocalNotifier::new(toasts.clone(), self.native, probe.clone()));

        let registrar: Arc<dyn PushRegistrar> = match self.registrar {
            Some(registrar) => registrar,
            None => {
                let mut registrar =
                    KeypairRegistrar::new(config.push.device_endpoint.clone().unwrap_or_default());
                if let Some(path) = &config.push.key_file {
                    registrar = registrar.with_key_file(path)?;
                }
                Arc::new(registrar)
            }
        };
        let store: Arc<dyn SubscriptionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(RestSubscriptionStore::new(
                &config.backend.url,
                config.backend.anon_key.clone(),
                config.backend.access_token.clone(),
            )?),
        };
        let push = Arc::new(
            PushSubscriptionManager::new(
                config.user_id.clone(),
                probe.clone(),
                registrar,
                store,
                local.clone(),
            )
            .with_application_server_key(config.push.vapid_public_key.clone()),
        );

        let realtime = if caps.has_realtime_socket_support {
            let realtime_config = RealtimeConfig::new(
                config.realtime_url()?,
                RealtimeConfig::user_topic(&config.user_id),
            )
            .with_policy(config.reconnect_policy())
            .with_heartbeat_interval(config.heartbeat_interval());
            let transport: Arc<dyn Transport> = match self.transport {
                Some(transport) => transport,
                None => Arc::new(WsTransport),
            };
            Some(Arc::new(RealtimeChannel::new(realtime_config, transport)))
        } else {
            None
        };

        let mut limiter = RateLimiter::new(
            config.rate_limit.limit,
            Duration::from_secs(config.rate_limit.window_secs),
        );
        if let Some(path) = &config.rate_limit.state_file {
            limiter = limiter.with_state_file(path)?;
        }

        let mut dispatcher = Dispatcher::new(push.clone(), local.clone())
            .with_rate_limiter(Arc::new(limiter))
            .with_preferences(config.preferences);
        if caps.has_push {
            let relay = match self.relay {
                Some(relay) => relay,
                None => Self::default_relay(&config)?,
            };
            dispatcher = dispatcher.with_relay(relay);
        }
        if let Some(channel) = &realtime {
            dispatcher = dispatcher.with_realtime_status(channel.watch_status());
        }
        let dispatcher = Arc::new(dispatcher);

        let scheduler = Arc::new(
            NotificationScheduler::new(dispatcher.clone())
                .with_poll_interval(config.poll_interval())
                .with_audit_retention(config.scheduler.audit_retention),
        );

        Ok(NotificationPipeline {
            config,
            probe,
            toasts,
            push,
            realtime,
            dispatcher,
            scheduler,
            running: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    scheduler: SchedulerGuard,
    listener: Option<JoinHandle<()>>,
}

pub struct NotificationPipeline {
    config: NotifyConfig,
    probe: Arc<dyn CapabilityProbe>,
    toasts: Arc<ToastCenter>,
    push: Arc<PushSubscriptionManager>,
    realtime: Option<Arc<RealtimeChannel>>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<NotificationScheduler>,
    running: Mutex<Option<Running>>,
    /// Serializes `start` across its await points.
    start_lock: tokio::sync::Mutex<()>,
}

impl NotificationPipeline {
    pub fn builder(config: NotifyConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.probe.probe()
    }

    pub fn toasts(&self) -> &Arc<ToastCenter> {
        &self.toasts
    }

    pub fn push(&self) -> &Arc<PushSubscriptionManager> {
        &self.push
    }

    pub fn realtime(&self) -> Option<&Arc<RealtimeChannel>> {
        self.realtime.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<NotificationScheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start background work. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let push_active = self.push.restore().await;
        let cancel = CancellationToken::new();

        let listener = self.realtime.as_ref().map(|channel| {
            // Subscribe before connecting so no early event is missed.
            let listener = self.spawn_listener(channel, self.push.watch_active(), cancel.clone());
            if push_active {
                debug!("Push subscription active, realtime fallback stays idle");
            } else {
                channel.connect();
            }
            listener
        });

        let scheduler = self.scheduler.start();
        *self.running.lock() = Some(Running {
            cancel,
            scheduler,
            listener,
        });

        info!(
            user_id = %self.config.user_id,
            push_active,
            realtime = self.realtime.is_some(),
            "Notification pipeline started"
        );
        Ok(())
    }

    fn spawn_listener(
        &self,
        channel: &Arc<RealtimeChannel>,
        mut push_active: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut events = channel.subscribe();
        let channel = channel.clone();
        let dispatcher = self.dispatcher.clone();
        let toasts = self.toasts.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Ok(()) = push_active.changed() => {
                        if !*push_active.borrow_and_update() {
                            info!("Push subscription gone, reconnecting realtime fallback");
                            channel.connect();
                        }
                        continue;
                    }
                    event = events.recv() => event,
                };
                match event {
                    Ok(RealtimeEvent::DeliveryUpdate(update)) => {
                        dispatcher.render_realtime_update(&update).await;
                    }
                    Ok(RealtimeEvent::ConnectionFailed { attempts }) => {
                        warn!(attempts, "Realtime connection gave up");
                        toasts.show(Toast::destructive(
                            CONNECTION_FAILED_TITLE,
                            CONNECTION_FAILED_BODY,
                        ));
                    }
                    Ok(RealtimeEvent::StatusChanged(status)) => {
                        debug!(%status, "Realtime status changed");
                    }
                    Ok(RealtimeEvent::Message(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Realtime listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Subscribe to push. Once push is active the realtime fallback is closed.
    pub async fn subscribe_push(&self) -> Result<PushSubscription> {
        let subscription = self.push.subscribe().await?;
        if let Some(channel) = &self.realtime {
            channel.disconnect().await;
        }
        Ok(subscription)
    }

    /// Unsubscribe from push and fall back to realtime while running.
    pub async fn unsubscribe_push(&self) -> Option<UnsubscribeOutcome> {
        let outcome = self.push.unsubscribe().await;
        if self.is_running()
            && let Some(channel) = &self.realtime
        {
            channel.connect();
        }
        outcome
    }

    /// Stop background work and close the realtime connection.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            running.scheduler.stop().await;
            if let Some(listener) = running.listener {
                let _ = listener.await;
            }
        }
        if let Some(channel) = &self.realtime {
            channel.disconnect().await;
        }
        info!("Notification pipeline stopped");
    }
}
