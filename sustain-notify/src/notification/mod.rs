//! Notification delivery pipeline.
//!
//! - [`capability`]: runtime feature detection
//! - [`push`]: push subscription lifecycle and relays
//! - [`scheduler`]: in-memory reminders fired on a poll interval
//! - [`dispatcher`]: picks push or local rendering per notification
//! - [`toast`]: local rendering
//! - [`service`]: wires everything together

pub mod capability;
pub mod dispatcher;
pub mod kind;
pub mod push;
pub mod rate_limit;
pub mod scheduler;
pub mod service;
pub mod toast;

pub use capability::{Capabilities, CapabilityProbe, ConfiguredProbe, NotificationPermission};
pub use dispatcher::{DeliveryChannel, Dispatch, DispatchOutcome, Dispatcher};
pub use kind::{NotificationKind, NotificationPayload, NotificationText, ScheduledNotification};
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use scheduler::{NotificationScheduler, SchedulerGuard};
pub use service::{NotificationPipeline, PipelineBuilder};
pub use toast::{LocalNotifier, NativeNotifier, RenderedVia, Toast, ToastCenter, ToastVariant};

#[cfg(feature = "desktop")]
pub use toast::DesktopNotifier;
