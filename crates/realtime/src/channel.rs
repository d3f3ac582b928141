//! Reconnecting realtime channel.
//!
//! A single background task owns the socket and drives the connection state
//! machine:
//!
//! - `disconnected` → `connect()` → `connecting`
//! - `connecting` → open → `connected` (reconnect counter reset)
//! - `connecting` / `connected` → error or close → `disconnected`, reconnect scheduled
//! - any state → `disconnect()` → `disconnected`, pending reconnect cancelled
//!
//! Reconnects follow [`ReconnectPolicy`]. Once the attempt budget is spent the
//! task emits [`RealtimeEvent::ConnectionFailed`] and exits; only an explicit
//! `connect()` starts it again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::{RealtimeError, Result};
use crate::event::{ConnectionStatus, DeliveryUpdate, RealtimeEvent};
use crate::frame::{Frame, HEARTBEAT_TOPIC, InboundMessage};
use crate::transport::{Socket, Transport, WsTransport};

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// Settings for a realtime channel.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Socket URL, API key included.
    pub url: String,
    /// Topic joined after every successful open.
    pub topic: String,
    pub policy: ReconnectPolicy,
    /// Heartbeat period. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: topic.into(),
            policy: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Per-user notification topic.
    pub fn user_topic(user_id: &str) -> String {
        format!("user:{}", user_id)
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// State shared between the channel handle and its worker task.
struct Shared {
    status_tx: watch::Sender<ConnectionStatus>,
    reconnect_attempt: AtomicU32,
    event_tx: broadcast::Sender<RealtimeEvent>,
    last_message: RwLock<Option<InboundMessage>>,
    outbound_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    next_ref: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            trace!(%status, "Realtime status changed");
            let _ = self.event_tx.send(RealtimeEvent::StatusChanged(status));
        }
    }

    fn next_reference(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    fn handle_text(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed realtime message");
                return;
            }
        };

        let message = InboundMessage::from_frame(&frame);
        *self.last_message.write() = Some(message.clone());
        let _ = self.event_tx.send(RealtimeEvent::Message(message));

        if let Some(update) = DeliveryUpdate::from_frame(&frame) {
            debug!(delivery_id = ?update.delivery_id, "Delivery update received");
            let _ = self.event_tx.send(RealtimeEvent::DeliveryUpdate(update));
        } else if !frame.is_reply() && frame.topic != HEARTBEAT_TOPIC {
            trace!(event = %frame.event, topic = %frame.topic, "Ignoring unrecognized realtime event");
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    /// Cancelled once the task has given up and will not touch state again.
    exhausted: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_live(&self) -> bool {
        !self.handle.is_finished() && !self.exhausted.is_cancelled()
    }
}

/// Best-effort live connection to the realtime endpoint.
pub struct RealtimeChannel {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig, transport: Arc<dyn Transport>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            transport,
            shared: Arc::new(Shared {
                status_tx,
                reconnect_attempt: AtomicU32::new(0),
                event_tx,
                last_message: RwLock::new(None),
                outbound_tx: Mutex::new(None),
                next_ref: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Channel over a real WebSocket.
    pub fn with_websocket(config: RealtimeConfig) -> Self {
        Self::new(config, Arc::new(WsTransport))
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Start (or restart) the connection task.
    ///
    /// No-op while a task is already running. Otherwise resets the reconnect
    /// counter, so this is also how a channel recovers after giving up.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut worker = self.worker.lock();
        if let Some(running) = worker.as_ref()
            && running.is_live()
        {
            debug!(topic = %self.config.topic, "Realtime channel already running");
            return;
        }

        self.shared.reconnect_attempt.store(0, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let exhausted = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.shared.outbound_tx.lock() = Some(outbound_tx);
        self.shared.set_status(ConnectionStatus::Connecting);

        let session = Session {
            config: self.config.clone(),
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
            exhausted: exhausted.clone(),
            outbound_rx,
        };
        let handle = tokio::spawn(session.run());
        *worker = Some(Worker {
            cancel,
            exhausted,
            handle,
        });
    }

    /// Close the socket and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let worker = self.worker.lock().take();
        self.shared.outbound_tx.lock().take();

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "Realtime channel task ended abnormally");
            }
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!(topic = %self.config.topic, "Realtime channel disconnected");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Reconnects performed since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.reconnect_attempt.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn last_message(&self) -> Option<InboundMessage> {
        self.shared.last_message.read().clone()
    }

    /// Queue an outbound frame. Fails unless the socket is connected.
    pub fn send_message(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let guard = self.shared.outbound_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(RealtimeError::NotConnected);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RealtimeError::other("outbound queue is full"),
            mpsc::error::TrySendError::Closed(_) => RealtimeError::NotConnected,
        })
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    Cancelled,
    Lost,
}

/// Worker task state. Owns the socket for its whole lifetime.
struct Session {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    exhausted: CancellationToken,
    outbound_rx: mpsc::Receiver<Frame>,
}

impl Session {
    async fn run(mut self) {
        let max_attempts = self.config.policy.max_attempts;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.shared.set_status(ConnectionStatus::Connecting);
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.transport.open(&self.config.url) => result,
            };

            match opened {
                Ok(mut socket) => {
                    info!(topic = %self.config.topic, "Realtime channel connected");
                    self.shared.set_status(ConnectionStatus::Connected);
                    self.shared.reconnect_attempt.store(0, Ordering::SeqCst);

                    let exit = self.serve(socket.as_mut()).await;
                    if exit == SessionExit::Cancelled {
                        socket.close().await;
                        break;
                    }
                    warn!(topic = %self.config.topic, "Realtime connection lost");
                    self.shared.set_status(ConnectionStatus::Disconnected);
                }
                Err(e) => {
                    warn!(error = %e, "Realtime connection attempt failed");
                    self.shared.set_status(ConnectionStatus::Disconnected);
                }
            }

            let attempt = self.shared.reconnect_attempt.load(Ordering::SeqCst);
            if !self.config.policy.allows(attempt) {
                error!(attempts = attempt, "Max reconnect attempts reached, giving up");
                // A `connect()` from here on starts a fresh task.
                self.exhausted.cancel();
                let _ = self
                    .shared
                    .event_tx
                    .send(RealtimeEvent::ConnectionFailed { attempts: attempt });
                return;
            }

            let delay = self.config.policy.delay_for(attempt);
            debug!(?delay, attempt, "Scheduling realtime reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = attempt + 1;
            self.shared.reconnect_attempt.store(attempt, Ordering::SeqCst);
            info!("Attempting to reconnect... ({}/{})", attempt, max_attempts);
        }

        self.shared.set_status(ConnectionStatus::Disconnected);
        debug!(topic = %self.config.topic, "Realtime channel task stopped");
    }

    async fn serve(&mut self, socket: &mut dyn Socket) -> SessionExit {
        let join = Frame::join(self.config.topic.clone(), self.shared.next_reference());
        if let Err(e) = send_frame(socket, &join).await {
            warn!(error = %e, "Failed to join realtime topic");
            return SessionExit::Lost;
        }

        let heartbeat_enabled = !self.config.heartbeat_interval.is_zero();
        let period = self.config.heartbeat_interval.max(Duration::from_secs(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let cancel = &self.cancel;
        let shared = &self.shared;
        let outbound_rx = &mut self.outbound_rx;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionExit::Cancelled,

                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let frame = Frame::heartbeat(shared.next_reference());
                    if let Err(e) = send_frame(socket, &frame).await {
                        warn!(error = %e, "Failed to send heartbeat");
                        return SessionExit::Lost;
                    }
                    trace!("Sent realtime heartbeat");
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = send_frame(socket, &frame).await {
                        warn!(error = %e, "Failed to send realtime message");
                        return SessionExit::Lost;
                    }
                }

                inbound = socket.next_text() => match inbound {
                    Some(Ok(text)) => shared.handle_text(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "Realtime socket error");
                        return SessionExit::Lost;
                    }
                    None => return SessionExit::Lost,
                },
            }
        }
    }
}

async fn send_frame(socket: &mut dyn Socket, frame: &Frame) -> Result<()> {
    socket.send_text(frame.to_text()?).await
}
