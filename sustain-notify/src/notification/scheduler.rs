//! In-memory notification scheduler.
//!
//! Items are held in insertion order and checked on a fixed interval. Every
//! due item is claimed (marked delivered) under the lock and then handed to
//! the dispatcher, so each item is attempted at most once whatever the
//! dispatcher returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::Dispatch;
use super::kind::{NotificationPayload, ScheduledNotification};

/// Lead time of a delivery reminder.
pub const DELIVERY_REMINDER_LEAD: chrono::Duration = chrono::Duration::minutes(30);
/// Delay of a pickup reminder.
pub const PICKUP_REMINDER_DELAY: chrono::Duration = chrono::Duration::hours(1);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_AUDIT_RETENTION: usize = 256;

#[derive(Default)]
struct SchedulerState {
    pending: Vec<ScheduledNotification>,
    /// Delivered items, oldest first.
    delivered: VecDeque<ScheduledNotification>,
}

pub struct NotificationScheduler {
    dispatcher: Arc<dyn Dispatch>,
    poll_interval: Duration,
    audit_retention: usize,
    state: Mutex<SchedulerState>,
}

impl NotificationScheduler {
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            dispatcher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            audit_retention: DEFAULT_AUDIT_RETENTION,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Poll period of [`start`](Self::start). Zero falls back to the default.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!(default = ?DEFAULT_POLL_INTERVAL, "Zero poll interval, using default");
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        } else {
            self.poll_interval = interval;
        }
        self
    }

    pub fn with_audit_retention(mut self, retention: usize) -> Self {
        self.audit_retention = retention;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Queue a notification. A past `fire_at` fires on the next tick.
    pub fn schedule(&self, payload: NotificationPayload, fire_at: DateTime<Utc>) -> Uuid {
        let notification = ScheduledNotification::new(payload, fire_at);
        let id = notification.id;
        debug!(%id, kind = %notification.kind(), %fire_at, "Notification scheduled");
        self.state.lock().pending.push(notification);
        id
    }

    /// Remove a pending item. Unknown or already delivered ids are a no-op.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|n| n.id != id);
        let removed = state.pending.len() != before;
        if removed {
            debug!(%id, "Notification cancelled");
        }
        removed
    }

    /// Undelivered items in insertion order.
    pub fn pending(&self) -> Vec<ScheduledNotification> {
        self.state.lock().pending.clone()
    }

    /// Recently delivered items, oldest first.
    pub fn delivered(&self) -> Vec<ScheduledNotification> {
        self.state.lock().delivered.iter().cloned().collect()
    }

    /// Remind about a delivery 30 minutes before it is due.
    pub fn schedule_delivery_reminder(
        &self,
        delivery_id: impl Into<String>,
        scheduled_time: DateTime<Utc>,
        address: impl Into<String>,
    ) -> Uuid {
        let time = scheduled_time
            .with_timezone(&Local)
            .format("%-I:%M %p")
            .to_string();
        self.schedule(
            NotificationPayload::DeliveryReminder {
                delivery_id: delivery_id.into(),
                address: address.into(),
                time,
            },
            scheduled_time - DELIVERY_REMINDER_LEAD,
        )
    }

    /// Remind about a donation pickup in one hour.
    pub fn schedule_pickup_reminder(
        &self,
        donation_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Uuid {
        self.schedule(
            NotificationPayload::PickupReminder {
                donation_id: donation_id.into(),
                address: address.into(),
            },
            Utc::now() + PICKUP_REMINDER_DELAY,
        )
    }

    /// Announce a delivery status change on the next tick.
    pub fn schedule_status_update(
        &self,
        delivery_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Uuid {
        self.schedule(
            NotificationPayload::StatusUpdate {
                delivery_id: delivery_id.into(),
                status: status.into(),
            },
            Utc::now(),
        )
    }

    pub async fn tick(&self) -> usize {
        self.tick_at(Utc::now()).await
    }

    /// Dispatch everything due at `now`. Returns the number of items attempted.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let due = self.claim_due(now);
        for notification in &due {
            match self.dispatcher.dispatch(notification).await {
                Ok(outcome) => debug!(
                    id = %notification.id,
                    channel = %outcome.channel,
                    "Notification delivered"
                ),
                Err(e) => warn!(id = %notification.id, error = %e, "Notification dispatch failed"),
            }
        }
        if !due.is_empty() {
            info!(count = due.len(), "Dispatched due notifications");
        }
        due.len()
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Vec<ScheduledNotification> {
        let mut state = self.state.lock();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|n| n.is_due(now));
        state.pending = pending;

        let due: Vec<_> = due
            .into_iter()
            .map(|mut n| {
                n.delivered = true;
                n
            })
            .collect();

        state.delivered.extend(due.iter().cloned());
        while state.delivered.len() > self.audit_retention {
            state.delivered.pop_front();
        }
        due
    }

    /// Poll on the configured interval until the guard is dropped or stopped.
    /// The first tick runs immediately.
    pub fn start(self: &Arc<Self>) -> SchedulerGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scheduler = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?scheduler.poll_interval, "Notification scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.tick().await;
                    }
                }
            }
            debug!("Notification scheduler stopped");
        });

        SchedulerGuard {
            cancel,
            handle: Some(handle),
        }
    }
}

/// Running poll loop. Dropping it stops the loop.
pub struct SchedulerGuard {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerGuard {
    /// Stop and wait for an in-flight tick to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::dispatcher::{DeliveryChannel, DispatchOutcome};
    use crate::{Error, Result};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingDispatcher {
        seen: Mutex<Vec<Uuid>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatch for RecordingDispatcher {
        async fn dispatch(&self, notification: &ScheduledNotification) -> Result<DispatchOutcome> {
            assert!(notification.delivered);
            self.seen.lock().push(notification.id);
            if self.fail {
                return Err(Error::Other("renderer unavailable".to_string()));
            }
            Ok(DispatchOutcome {
                channel: DeliveryChannel::LocalToast,
                rendered: None,
                receipt: None,
            })
        }
    }

    fn pickup() -> NotificationPayload {
        NotificationPayload::PickupReminder {
            donation_id: "n1".to_string(),
            address: "Food Bank".to_string(),
        }
    }

    fn scheduler(fail: bool) -> (Arc<NotificationScheduler>, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher {
            seen: Mutex::new(Vec::new()),
            fail,
        });
        (
            Arc::new(NotificationScheduler::new(dispatcher.clone())),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn test_due_item_dispatched_exactly_once() {
        let (scheduler, dispatcher) = scheduler(false);
        let now = Utc::now();
        let id = scheduler.schedule(pickup(), now - chrono::Duration::seconds(1));
        let later = scheduler.schedule(pickup(), now + chrono::Duration::hours(1));

        assert_eq!(scheduler.tick_at(now).await, 1);
        assert_eq!(scheduler.tick_at(now).await, 0);
        assert_eq!(*dispatcher.seen.lock(), vec![id]);

        let pending: Vec<_> = scheduler.pending().iter().map(|n| n.id).collect();
        assert_eq!(pending, vec![later]);
        let delivered = scheduler.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].delivered);
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_marks_delivered() {
        let (scheduler, dispatcher) = scheduler(true);
        let now = Utc::now();
        let id = scheduler.schedule(pickup(), now);

        assert_eq!(scheduler.tick_at(now).await, 1);
        assert!(scheduler.pending().is_empty());
        assert_eq!(scheduler.tick_at(now).await, 0);
        assert_eq!(*dispatcher.seen.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_cancel_before_and_after_tick() {
        let (scheduler, dispatcher) = scheduler(false);
        let now = Utc::now();
        let cancelled = scheduler.schedule(pickup(), now);
        let fired = scheduler.schedule(pickup(), now);

        assert!(scheduler.cancel(cancelled));
        scheduler.tick_at(now).await;
        assert_eq!(*dispatcher.seen.lock(), vec![fired]);

        assert!(!scheduler.cancel(fired));
        assert!(!scheduler.cancel(Uuid::new_v4()));
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_all_due_items_fire_in_one_tick_in_insertion_order() {
        let (scheduler, dispatcher) = scheduler(false);
        let now = Utc::now();
        let ids: Vec<_> = (0..3)
            .map(|i| scheduler.schedule(pickup(), now - chrono::Duration::minutes(i)))
            .collect();

        assert_eq!(scheduler.tick_at(now).await, 3);
        assert_eq!(*dispatcher.seen.lock(), ids);
    }

    #[tokio::test]
    async fn test_audit_retention_prunes_oldest() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let scheduler = NotificationScheduler::new(dispatcher).with_audit_retention(2);
        let now = Utc::now();
        let ids: Vec<_> = (0..3).map(|_| scheduler.schedule(pickup(), now)).collect();

        scheduler.tick_at(now).await;
        let kept: Vec<_> = scheduler.delivered().iter().map(|n| n.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn test_producers() {
        let (scheduler, _) = scheduler(false);
        let delivery_at = Utc::now() + chrono::Duration::hours(2);
        scheduler.schedule_delivery_reminder("d1", delivery_at, "12 Elm St");
        scheduler.schedule_pickup_reminder("n1", "Food Bank");
        scheduler.schedule_status_update("d1", "delivered");

        let pending = scheduler.pending();
        assert_eq!(pending[0].fire_at, delivery_at - DELIVERY_REMINDER_LEAD);
        match &pending[0].payload {
            NotificationPayload::DeliveryReminder { address, time, .. } => {
                assert_eq!(address, "12 Elm St");
                assert!(time.ends_with("AM") || time.ends_with("PM"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(pending[1].fire_at > Utc::now() + chrono::Duration::minutes(59));
        assert!(pending[2].is_due(Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_fires_within_one_interval() {
        let (scheduler, dispatcher) = scheduler(false);
        let first = scheduler.schedule(pickup(), Utc::now() - chrono::Duration::seconds(1));

        let guard = scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*dispatcher.seen.lock(), vec![first]);

        let second = scheduler.schedule(pickup(), Utc::now() - chrono::Duration::seconds(1));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(dispatcher.seen.lock().len(), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*dispatcher.seen.lock(), vec![first, second]);

        guard.stop().await;
        let third = scheduler.schedule(pickup(), Utc::now());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!dispatcher.seen.lock().contains(&third));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_falls_back_to_default() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let scheduler = Arc::new(
            NotificationScheduler::new(dispatcher.clone()).with_poll_interval(Duration::ZERO),
        );
        assert_eq!(scheduler.poll_interval(), DEFAULT_POLL_INTERVAL);

        let id = scheduler.schedule_status_update("d1", "delivered");
        let guard = scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*dispatcher.seen.lock(), vec![id]);
        assert!(scheduler.pending().is_empty());

        guard.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_guard_stops_polling() {
        let (scheduler, dispatcher) = scheduler(false);
        drop(scheduler.start());
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.schedule(pickup(), Utc::now());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(dispatcher.seen.lock().is_empty());
    }
}
