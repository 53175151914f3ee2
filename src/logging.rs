//! Tracing subscriber setup for the long-running control plane and one-shot commands

use crate::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "hivectl.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. File logging is enabled when
/// `HIVE_LOG_DIR` or `logging.dir` names a writable directory; the returned
/// guard must be held until exit so buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = std::env::var("HIVE_LOG_DIR")
        .ok()
        .or_else(|| config.dir.clone());

    // `rolling::daily` panics if it cannot create the first file, so check writability first
    let (file_layer, guard) = match log_dir.as_deref().filter(|dir| is_writable(dir)) {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => {
            if let Some(dir) = &log_dir {
                eprintln!("Warning: log directory {dir} is not writable, file logging disabled");
            }
            (None, None)
        }
    };

    let (json_layer, plain_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        eprintln!("Warning: a global tracing subscriber is already installed");
    }

    if let (Some(dir), Some(_)) = (&log_dir, &guard) {
        eprintln!("Logging to: {dir}/{LOG_FILE_NAME}");
    }
    guard
}

/// Minimal logging for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn is_writable(dir: &str) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = Path::new(dir).join(".hivectl_write_test");
    let writable = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
        .is_ok();
    let _ = std::fs::remove_file(&probe);
    writable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_directory_is_rejected() {
        assert!(!is_writable("/proc/hivectl-logs"));
    }

    #[test]
    fn test_temp_directory_is_writable() {
        let dir = std::env::temp_dir().join(format!("hivectl-log-test-{}", std::process::id()));
        let dir = dir.to_string_lossy().to_string();
        assert!(is_writable(&dir));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
