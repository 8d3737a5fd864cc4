//! Channel identity and the channel helper (§3, §4.1).
//!
//! A channel is identified by `(id, protocol)`. The helper functions here
//! (`ensure`, `pair`, `open`, `unpair`, `get_channel`, `is_open`) are the
//! thin orchestration layer between a [`crate::duplex::PlexDuplex`] and the
//! [`crate::substrate::Substrate`] that actually owns the multiplexed
//! stream. They exist as free functions (rather than methods scattered
//! across `Substrate`) so the contract in spec.md §4.1 stays legible as one
//! unit, matching the teacher's habit of keeping a subsystem's entry points
//! together at the top of its module.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::duplex::LifecycleEvent;
use crate::error::{PlexError, Result};
use crate::substrate::Substrate;

/// Opaque channel identity. Typically a short caller-derived byte string.
/// Equality is bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(pub Bytes);

impl ChannelId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

/// `"{base}/{lane}"`, e.g. `"neonloom/protocol/v1/rpc"`. Equality is string
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Protocol(pub String);

impl Protocol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn with_lane(base: &str, lane: &str) -> Self {
        Self(format!("{base}/{lane}"))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(id, protocol)` key a channel is located by.
pub type ChannelKey = (ChannelId, Protocol);

/// Caller-provided, normalized channel configuration (§3).
///
/// Normalization (computing the `(id, protocol)` key, resolving the shared
/// substrate for the transport) happens once in [`ChannelConfig::new`] and
/// is idempotent — constructing from already-normalized fields is a no-op,
/// matching the spec's "re-entering normalization is a no-op" invariant.
#[derive(Clone)]
pub struct ChannelConfig {
    pub substrate: Arc<Substrate>,
    pub id: ChannelId,
    pub protocol: Protocol,
    /// Handshake payload sent with the `open` frame, if any.
    pub handshake_message: Option<Bytes>,
    /// Whether a handshake encoding was configured at all (distinguishes
    /// "open with zero-length payload" from "open with no payload", per
    /// §4.1 `open(cfg)`). Encoding/decoding of the handshake payload itself
    /// is a caller concern — the codec registry is out of scope.
    pub has_handshake_encoding: bool,
}

impl ChannelConfig {
    pub fn new(substrate: Arc<Substrate>, id: ChannelId, protocol: Protocol) -> Self {
        Self {
            substrate,
            id,
            protocol,
            handshake_message: None,
            has_handshake_encoding: false,
        }
    }

    pub fn with_handshake(mut self, payload: impl Into<Bytes>) -> Self {
        self.handshake_message = Some(payload.into());
        self.has_handshake_encoding = true;
        self
    }

    pub fn key(&self) -> ChannelKey {
        (self.id.clone(), self.protocol.clone())
    }
}

/// `get-channel(cfg)` — locate an already-open channel matching
/// `(id, protocol)` on the config's substrate.
pub fn get_channel(cfg: &ChannelConfig) -> Option<Arc<crate::substrate::ChannelHandle>> {
    cfg.substrate.get(&cfg.key())
}

/// `is-open(cfg)` — true iff the substrate reports a channel open for
/// `(id, protocol)`.
pub fn is_open(cfg: &ChannelConfig) -> bool {
    get_channel(cfg).map(|c| c.is_connected()).unwrap_or(false)
}

/// `ensure(cfg)` — reuse an existing channel or create one on the
/// substrate, wiring the given lifecycle/message sender.
pub fn ensure(
    cfg: &ChannelConfig,
    events: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
    inbound: tokio::sync::mpsc::UnboundedSender<Bytes>,
) -> Arc<crate::substrate::ChannelHandle> {
    if let Some(existing) = get_channel(cfg) {
        return existing;
    }
    cfg.substrate.create(cfg.key(), events, inbound)
}

/// `open(cfg)` — ensure a channel exists, then actively open it (connect
/// side). If a handshake payload was configured it is sent with the open
/// frame; otherwise an empty payload is sent.
pub async fn open(
    cfg: &ChannelConfig,
    events: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
    inbound: tokio::sync::mpsc::UnboundedSender<Bytes>,
) -> Result<Arc<crate::substrate::ChannelHandle>> {
    let handle = ensure(cfg, events, inbound);
    let payload = cfg.handshake_message.clone().unwrap_or_default();
    handle.open(payload).await?;
    Ok(handle)
}

/// `pair(cfg, on-pair)` — register interest in the remote opening
/// `(id, protocol)`. When it does, the channel is opened locally and
/// `on_pair` is invoked.
pub fn pair(
    cfg: &ChannelConfig,
    events: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
    inbound: tokio::sync::mpsc::UnboundedSender<Bytes>,
) -> crate::substrate::PairToken {
    cfg.substrate.pair(cfg.key(), events, inbound)
}

/// `unpair(cfg)` — cancel an outstanding pair registration.
pub fn unpair(cfg: &ChannelConfig, token: crate::substrate::PairToken) {
    cfg.substrate.unpair(&cfg.key(), token);
}

impl From<PlexError> for LifecycleEvent {
    fn from(err: PlexError) -> Self {
        LifecycleEvent::Destroy(Some(err.to_string()))
    }
}
