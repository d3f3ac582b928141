//! Best-effort realtime channel for per-user notification topics.
//!
//! Maintains a single WebSocket connection, joins the user's topic, parses
//! inbound frames and reconnects with bounded exponential backoff. Consumers
//! observe the channel through a status [`tokio::sync::watch`] and a broadcast
//! stream of [`RealtimeEvent`]s.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod event;
pub mod frame;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use channel::{RealtimeChannel, RealtimeConfig};
pub use error::{RealtimeError, Result};
pub use event::{ConnectionStatus, DeliveryUpdate, RealtimeEvent};
pub use frame::{Frame, InboundMessage};
pub use transport::{Socket, Transport, WsTransport};
