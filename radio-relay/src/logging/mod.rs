//! Logging setup with a runtime-reloadable filter.
//!
//! Events go to the console and to a daily-rolled file under the configured
//! log directory. Rolled files older than [`LOG_RETENTION_DAYS`] are removed
//! by a background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
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

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "radio_relay=info,tower_http=warn,reqwest=warn";

/// Rolled log files are kept for this many days.
pub const LOG_RETENTION_DAYS: i64 = 7;

const LOG_FILE_PREFIX: &str = "radio-relay.log";

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// The active filter directive.
    pub fn current_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter, e.g. `radio_relay=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Spawn the daily retention sweep. Stops when `cancel_token` fires.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let period = Duration::from_secs(24 * 60 * 60);
            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, Utc::now().date_naive()).await {
                    warn!(error = %e, "Failed to clean up old logs");
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
            }
        });
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    if directive.trim().is_empty() {
        return Err(Error::validation("Filter directive must not be empty"));
    }
    EnvFilter::try_new(directive)
        .map_err(|e| Error::validation(format!("Invalid filter directive: {}", e)))
}

/// The date encoded in a rolled file name (`radio-relay.log.YYYY-MM-DD`).
fn rolled_file_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete rolled files dated more than [`LOG_RETENTION_DAYS`] before `today`.
async fn cleanup_old_logs(log_dir: &Path, today: NaiveDate) -> std::io::Result<usize> {
    let cutoff = today - chrono::Duration::days(LOG_RETENTION_DAYS);
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_file_date)
        else {
            continue;
        };
        if date >= cutoff {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, or
/// buffered file output is lost.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir).map_err(|e| {
        Error::config(format!(
            "Failed to create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
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

    let config = Arc::new(LoggingConfig {
        handle,
        log_dir: log_dir.to_path_buf(),
    });
    Ok((config, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(parse_filter(DEFAULT_LOG_FILTER).is_ok());
        assert!(DEFAULT_LOG_FILTER.contains("radio_relay=info"));
    }

    #[test]
    fn test_rejects_bad_directives() {
        assert!(matches!(parse_filter("  "), Err(Error::Validation(_))));
        assert!(parse_filter("radio_relay=loud").is_err());
    }

    #[test]
    fn test_rolled_file_date() {
        assert_eq!(
            rolled_file_date("radio-relay.log.2026-03-01"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(rolled_file_date("radio-relay.log"), None);
        assert_eq!(rolled_file_date("other.log.2026-03-01"), None);
        assert_eq!(rolled_file_date("radio-relay.log.yesterday"), None);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();
        for name in [
            "radio-relay.log.2026-01-01",
            "radio-relay.log.2026-01-09",
            "radio-relay.log.2026-01-10",
            "notes.txt",
        ] {
            tokio::fs::write(dir.join(name), b"x").await.unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let deleted = cleanup_old_logs(dir, today).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!dir.join("radio-relay.log.2026-01-01").exists());
        assert!(dir.join("radio-relay.log.2026-01-09").exists());
        assert!(dir.join("notes.txt").exists());
    }
}
