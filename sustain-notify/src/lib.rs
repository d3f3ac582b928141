//! sustain-notify library crate.
//!
//! Client-side notification delivery: capability probing, push subscriptions,
//! a realtime fallback channel, scheduled reminders and local rendering.

pub mod config;
pub mod error;
pub mod logging;
pub mod notification;

pub use config::NotifyConfig;
pub use error::{Error, Result};
