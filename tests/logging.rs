//! Exercises the file-logging path of `plex::logging::init` (`SPEC_FULL.md`'s
//! logging section). Deliberately the ONLY test in this binary that calls
//! `init` — `tracing_subscriber`'s global subscriber can only be installed
//! once per process, and `cargo test` runs a file's tests as threads in one
//! process, so a second call here would panic.

use std::path::Path;

#[test]
fn init_with_log_file_path_returns_a_worker_guard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("logs").join("plex.log");

    let guard = plex::logging::init("info", Some(log_path.as_path()));

    assert!(guard.is_some(), "a writable log file path should yield a worker guard");
    assert!(Path::new(&log_path).parent().unwrap().is_dir(), "the log directory should have been created");
}
