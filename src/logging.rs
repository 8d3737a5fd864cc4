//! Structured logging setup for the CLI smoke harness.
//!
//! Library code never calls into this module — it only ever emits
//! `tracing` events and trusts the embedding application (or this crate's
//! own `plex-cli` binary) to have installed a subscriber. This mirrors the
//! teacher's `setup_logging`: stdout-only by default, a daily-rolling file
//! layered in when a path is configured, and a graceful fallback to
//! stdout-only logging if the log directory can't be created — never panic
//! over logging.

use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber. Returns a guard that must be
/// kept alive for the process lifetime when file logging is enabled (the
/// non-blocking writer flushes on drop).
pub fn init(log_level: &str, log_file: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("plex.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}
