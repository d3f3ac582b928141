//! Capability probing.
//!
//! Absent capabilities are ordinary `false` values, never errors.

use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// Local notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Never asked.
    #[default]
    Default,
}

impl fmt::Display for NotificationPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl FromStr for NotificationPermission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            "default" | "" => Ok(Self::Default),
            other => Err(Error::config(format!(
                "invalid notification permission '{}'",
                other
            ))),
        }
    }
}

/// Result of a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub has_push: bool,
    pub has_realtime_socket_support: bool,
    pub notification_permission: NotificationPermission,
}

/// Runtime feature detection.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> Capabilities;

    /// Ask the user for notification permission.
    ///
    /// A decided permission is returned unchanged.
    fn request_permission(&self) -> NotificationPermission {
        self.probe().notification_permission
    }
}

/// Probe answering from configuration.
///
/// `prompt_answer` is what a permission prompt resolves to while the
/// permission is still undecided.
#[derive(Debug)]
pub struct ConfiguredProbe {
    has_push: bool,
    has_realtime: bool,
    permission: RwLock<NotificationPermission>,
    prompt_answer: NotificationPermission,
}

impl ConfiguredProbe {
    pub fn new(has_push: bool, has_realtime: bool, permission: NotificationPermission) -> Self {
        Self {
            has_push,
            has_realtime,
            permission: RwLock::new(permission),
            prompt_answer: NotificationPermission::Granted,
        }
    }

    pub fn with_prompt_answer(mut self, answer: NotificationPermission) -> Self {
        self.prompt_answer = answer;
        self
    }

    pub fn set_permission(&self, permission: NotificationPermission) {
        *self.permission.write() = permission;
    }
}

impl CapabilityProbe for ConfiguredProbe {
    fn probe(&self) -> Capabilities {
        Capabilities {
            has_push: self.has_push,
            has_realtime_socket_support: self.has_realtime,
            notification_permission: *self.permission.read(),
        }
    }

    fn request_permission(&self) -> NotificationPermission {
        let mut permission = self.permission.write();
        if *permission == NotificationPermission::Default {
            *permission = self.prompt_answer;
            debug!(permission = %*permission, "Notification permission prompt answered");
        }
        *permission
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_configuration() {
        let probe = ConfiguredProbe::new(false, true, NotificationPermission::Denied);
        let caps = probe.probe();
        assert!(!caps.has_push);
        assert!(caps.has_realtime_socket_support);
        assert_eq!(caps.notification_permission, NotificationPermission::Denied);
    }

    #[test]
    fn test_prompt_only_resolves_undecided_permission() {
        let probe = ConfiguredProbe::new(true, true, NotificationPermission::Default)
            .with_prompt_answer(NotificationPermission::Granted);
        assert_eq!(probe.request_permission(), NotificationPermission::Granted);

        probe.set_permission(NotificationPermission::Denied);
        assert_eq!(probe.request_permission(), NotificationPermission::Denied);
    }

    #[test]
    fn test_capabilities_serialize_camel_case() {
        let caps = ConfiguredProbe::new(true, false, NotificationPermission::Default).probe();
        let json = serde_json::to_value(caps).unwrap();
        assert_eq!(json["hasPush"], true);
        assert_eq!(json["hasRealtimeSocketSupport"], false);
        assert_eq!(json["notificationPermission"], "default");
    }
}
