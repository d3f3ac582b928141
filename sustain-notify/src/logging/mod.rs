//! Logging setup: reloadable filter, console + daily file output, retention.

use chrono::{Local, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "sustain_notify=info,realtime_channel=info,reqwest=warn";

/// Rolling log file prefix; files are named `<prefix>.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "sustain-notify.log";

const LOG_RETENTION_DAYS: i64 = 7;

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle onto the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `"sustain_notify=debug,realtime_channel=trace"`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;
        info!(%directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Delete old log files once a day until `cancel_token` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            let every = Duration::from_secs(24 * 60 * 60);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(every) => {
                        match cleanup_old_logs(&log_dir, LOG_FILE_PREFIX, LOG_RETENTION_DAYS).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Cleaned up old log files"),
                            Err(e) => warn!(error = %e, "Failed to clean up old logs"),
                        }
                    }
                }
            }
        });
    }
}

/// Remove `<prefix>.YYYY-MM-DD` files dated before the retention cutoff.
/// Returns how many were deleted.
async fn cleanup_old_logs(log_dir: &Path, prefix: &str, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }
    Ok(deleted)
}

/// Install the global subscriber. Keep the guard alive for the process lifetime.
pub fn init_logging(log_dir: &str) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok((
        Arc::new(LoggingConfig {
            handle,
            log_dir: log_path,
        }),
        guard,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        assert!(DEFAULT_LOG_FILTER.contains("sustain_notify=info"));
    }

    #[test]
    fn test_filter_can_be_replaced() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new(DEFAULT_LOG_FILTER));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let logging = LoggingConfig {
            handle,
            log_dir: PathBuf::from("logs"),
        };
        assert!(logging.get_filter().contains("sustain_notify=info"));

        logging.set_filter("sustain_notify=debug").unwrap();
        assert_eq!(logging.get_filter(), "sustain_notify=debug");

        assert!(logging.set_filter("sustain_notify=loud").is_err());
        assert_eq!(logging.get_filter(), "sustain_notify=debug");
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(format!("{}.2020-01-01", LOG_FILE_PREFIX));
        let today = dir
            .path()
            .join(format!("{}.{}", LOG_FILE_PREFIX, Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("other.log.2020-01-01");
        for path in [&old, &today, &unrelated] {
            std::fs::write(path, "x").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_FILE_PREFIX, LOG_RETENTION_DAYS)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(today.exists());
        assert!(unrelated.exists());
    }
}
