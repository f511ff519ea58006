//! # Logging Initialization
//!
//! Centralised `tracing` setup for the relay binaries.
//!
//! - **Environment Filter**: `RUST_LOG` wins when set; otherwise the given level
//!   applies everywhere, with `debug` for the relay crates themselves.
//! - **Stderr (default)**: ANSI-coloured output on stderr.
//! - **File (opt-in)**: a daily rolling file in the user cache directory, written
//!   through `tracing_appender`'s non-blocking writer. Falls back to stderr when the
//!   directory cannot be determined or written.
//!
//! Initialisation runs once per process; later calls are no-ops.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

const LOG_FILE_NAME: &str = "relay.log";

/// Initialize verbose logging for tests.
pub fn init_test_logging() {
    let _ = init_logging("trace", false);
}

/// Initializes the global tracing subscriber.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for fallible sinks.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{log_level},relay_common=debug,relay_http_bridge=debug,relay_http_client=debug"
            ))
        });

        if log_to_file && let Some(log_dir) = log_directory() {
            let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer().with_writer(non_blocking).with_ansi(false))
                .init();

            // Flushes on exit only while the guard lives.
            Box::leak(Box::new(guard));
            return;
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .init();
    });

    Ok(())
}

/// Cache directory for log files, if one exists and is writable.
fn log_directory() -> Option<std::path::PathBuf> {
    let dirs = ProjectDirs::from("com", "Relay", "relay")?;
    let dir = dirs.cache_dir().to_path_buf();
    can_write(&dir).then_some(dir)
}

/// `tracing_appender::rolling::daily` panics on permission errors, so probe first.
fn can_write(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(".relay_log_probe");
    match std::fs::write(&probe, "probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
