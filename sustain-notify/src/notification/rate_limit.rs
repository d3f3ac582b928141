//! Fixed-window rate limiter with an optional JSON state file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Snapshot of a key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub is_limited: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// At most `limit` tokens per key per window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: chrono::Duration,
    state_file: Option<PathBuf>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60)),
            state_file: None,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Persist windows to `path`, loading what is already there.
    ///
    /// An unreadable state file is discarded with a warning.
    pub fn with_state_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<HashMap<String, Window>>(&text) {
                Ok(windows) => *self.windows.get_mut() = windows,
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring corrupt rate limit state"),
            }
        } else if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        self.state_file = Some(path);
        Ok(self)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, key: &str) -> RateLimitStatus {
        self.check_at(key, Utc::now())
    }

    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitStatus {
        let windows = self.windows.lock();
        let window = self.current_window(windows.get(key).copied(), now);
        self.status(&window)
    }

    /// Take one token. Returns false when the key is limited.
    pub fn consume(&self, key: &str) -> bool {
        self.consume_at(key, Utc::now())
    }

    pub fn consume_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let snapshot = {
            let mut windows = self.windows.lock();
            let mut window = self.current_window(windows.get(key).copied(), now);
            if window.count >= self.limit {
                debug!(%key, reset_at = %window.reset_at, "Rate limited");
                return false;
            }
            window.count += 1;
            windows.insert(key.to_string(), window);
            windows.clone()
        };
        self.save(&snapshot);
        true
    }

    fn current_window(&self, stored: Option<Window>, now: DateTime<Utc>) -> Window {
        match stored {
            Some(window) if now <= window.reset_at => window,
            _ => Window {
                count: 0,
                reset_at: now + self.window,
            },
        }
    }

    fn status(&self, window: &Window) -> RateLimitStatus {
        let remaining = self.limit.saturating_sub(window.count);
        RateLimitStatus {
            remaining,
            reset_at: window.reset_at,
            is_limited: remaining == 0,
        }
    }

    fn save(&self, windows: &HashMap<String, Window>) {
        let Some(path) = &self.state_file else {
            return;
        };
        let result = serde_json::to_vec_pretty(windows)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(path, bytes));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to save rate limit state");
        }
    }
}
