//! Centralized environment-variable configuration (§6 of the design doc).
//!
//! All tuning is optional — every field has a built-in default so a caller
//! never has to construct this by hand. [`RpcLimits::from_env`] is the one
//! place that reads `std::env::var`; nothing else in the crate re-reads the
//! environment, so a value observed once at construction time stays stable
//! for the lifetime of the process (mirrors the teacher's `DaemonConfig`
//! "read once, pass down" pattern).

use std::time::Duration;

const DEFAULT_MAX_REQUEST_BYTES: usize = 262_144;
const DEFAULT_MAX_ROUTES: usize = 256;
const DEFAULT_ORPHAN_TTL_MS: u64 = 2_000;

/// Protocol namespace prefixed to every lane suffix (`"{base}/rpc"`, …).
pub const DEFAULT_PROTOCOL: &str = "neonloom/protocol/v1";

/// RPC-layer tuning, sourced from environment variables per spec.md §6.
/// Shared by both [`crate::rpc::server::RpcServer`] and
/// [`crate::rpc::client::RpcClient`] — server/client limits are tracked
/// separately since one process can host both roles over different peers.
#[derive(Debug, Clone)]
pub struct RpcLimits {
    /// `PLEX_RPC_MAX_REQUEST_BYTES` — per-request payload cap.
    pub max_request_bytes: usize,
    /// `PLEX_RPC_MAX_CLIENT_ROUTES` — in-flight limit on the client side.
    /// `0` disables the limit.
    pub max_client_routes: usize,
    /// `PLEX_RPC_MAX_SERVER_ROUTES` — in-flight limit on the server side.
    /// `0` disables the limit.
    pub max_server_routes: usize,
    /// `PLEX_RPC_CLIENT_TIMEOUT_MS` — default per-call timeout. `0` disables.
    pub client_timeout: Option<Duration>,
    /// `PLEX_RPC_ORPHAN_TTL_MS` — recently-closed retention window.
    pub orphan_ttl: Duration,
    /// `PLEX_RPC_CLIENT_STALL_WARN_MS` — diagnostic-only stall warning timer.
    pub stall_warn: Option<Duration>,
    /// `PLEX_RPC_PENDING_LOG_MS` — diagnostic-only periodic pending reminder.
    pub pending_log: Option<Duration>,
}

impl Default for RpcLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_client_routes: DEFAULT_MAX_ROUTES,
            max_server_routes: DEFAULT_MAX_ROUTES,
            client_timeout: None,
            orphan_ttl: Duration::from_millis(DEFAULT_ORPHAN_TTL_MS),
            stall_warn: None,
            pending_log: None,
        }
    }
}

impl RpcLimits {
    /// Build limits from environment variables, falling back to the
    /// built-in defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_request_bytes: env_usize("PLEX_RPC_MAX_REQUEST_BYTES", defaults.max_request_bytes),
            max_client_routes: env_usize("PLEX_RPC_MAX_CLIENT_ROUTES", defaults.max_client_routes),
            max_server_routes: env_usize("PLEX_RPC_MAX_SERVER_ROUTES", defaults.max_server_routes),
            client_timeout: env_u64("PLEX_RPC_CLIENT_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            orphan_ttl: env_u64("PLEX_RPC_ORPHAN_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.orphan_ttl),
            stall_warn: env_u64("PLEX_RPC_CLIENT_STALL_WARN_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            pending_log: env_u64("PLEX_RPC_PENDING_LOG_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Whether a non-semantic tracing toggle is enabled. These never change
/// observable RPC/pool behavior — only what gets logged — per spec.md §6.
pub fn trace_enabled(toggle: &str) -> bool {
    std::env::var(toggle)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
