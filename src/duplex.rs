//! The duplex wrapper: a stream-style view over one multiplexed channel
//! (§3 "duplex state", §4.2).
//!
//! Rendered here as a message-oriented async channel rather than a raw
//! `AsyncRead`/`AsyncWrite` byte stream — every consumer this crate builds
//! on top of a duplex (the RPC codec in particular) is itself message
//! framed ("one logical frame per message", §4.4), so preserving message
//! boundaries end to end is both simpler and more faithful to the spec's
//! own wire model than re-splitting a byte stream only to re-frame it one
//! layer up. See `DESIGN.md` for this rendering choice.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::channel::ChannelConfig;
use crate::error::{PlexError, Result};
use crate::substrate::{ChannelHandle, PairToken};

/// Lifecycle notifications a duplex surfaces to its owner (§3, §9 design
/// note on event-emitter lifecycle propagation becoming explicit listener
/// registration — here, a typed channel of a small sum type).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The remote opened its end, carrying the handshake payload if any.
    /// `connection` in spec.md is an alias for the same event.
    RemoteOpen(Option<Bytes>),
    /// The channel closed (precedes `Destroy`, invariant in §8).
    Close,
    /// The channel was torn down, locally or remotely. Carries an error
    /// message if teardown was caused by a failure.
    Destroy(Option<String>),
}

enum Mode {
    /// `open(cfg)` is called immediately.
    Connect,
    /// `pair(cfg, on_pair)` is registered; `open` runs after the remote
    /// initiates.
    Listen,
}

/// A stream-style duplex over one multiplexed `(id, protocol)` channel.
pub struct PlexDuplex {
    cfg: ChannelConfig,
    mode: Mode,
    handle: Arc<Mutex<Option<Arc<ChannelHandle>>>>,
    pair_token: Arc<Mutex<Option<PairToken>>>,
    events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl PlexDuplex {
    fn new(cfg: ChannelConfig, mode: Mode) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            mode,
            handle: Arc::new(Mutex::new(None)),
            pair_token: Arc::new(Mutex::new(None)),
            events_rx,
            events_tx,
            inbound_rx,
            inbound_tx,
        }
    }

    /// Connect-side constructor: opens the channel immediately.
    pub async fn connect(cfg: ChannelConfig) -> Result<Self> {
        let duplex = Self::new(cfg, Mode::Connect);
        let handle = crate::channel::open(&duplex.cfg, duplex.events_tx.clone(), duplex.inbound_tx.clone()).await?;
        *duplex.handle.lock().unwrap() = Some(handle);
        Ok(duplex)
    }

    /// Listen-side constructor: creates the channel handle up front (rather
    /// than waiting for `remote-open`) and registers a pair waiter for it.
    /// Creating the handle eagerly gives `send()` somewhere to buffer a
    /// write issued before the remote has paired — the handle's own
    /// `pending_writes` queue flushes once pairing completes and IO starts
    /// (§4.2, §8 "a buffered write issued before open is delivered exactly
    /// once and in original order after remote-open").
    pub fn listen(cfg: ChannelConfig) -> Self {
        let duplex = Self::new(cfg, Mode::Listen);
        let handle = crate::channel::ensure(&duplex.cfg, duplex.events_tx.clone(), duplex.inbound_tx.clone());
        *duplex.handle.lock().unwrap() = Some(handle);
        let token = crate::channel::pair(&duplex.cfg, duplex.events_tx.clone(), duplex.inbound_tx.clone());
        *duplex.pair_token.lock().unwrap() = Some(token);
        duplex
    }

    /// Send a message. Buffered internally by the channel handle until the
    /// channel is open; dropped silently once destroyed (§4.2).
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let handle = self.resolve_handle().await?;
        handle.send(data.into());
        Ok(())
    }

    /// The underlying channel handle, for callers (the RPC server/client)
    /// that need to clone a cheap `Arc` and send concurrently from several
    /// tasks rather than going through `send()` one call at a time.
    pub async fn channel_handle(&self) -> Result<Arc<ChannelHandle>> {
        self.resolve_handle().await
    }

    async fn resolve_handle(&self) -> Result<Arc<ChannelHandle>> {
        if let Some(handle) = self.handle.lock().unwrap().clone() {
            return Ok(handle);
        }
        // Falls back to a substrate lookup by key in case some other path
        // created the channel first (e.g. a race between `listen` and an
        // already-accepted inbound open it hasn't claimed yet).
        crate::channel::get_channel(&self.cfg).ok_or(PlexError::ChannelDestroyed)
    }

    /// Receive the next message, or `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound_rx.recv().await
    }

    /// Receive the next lifecycle event.
    pub async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.events_rx.recv().await
    }

    pub async fn is_connected(&self) -> bool {
        match self.handle.lock().unwrap().clone() {
            Some(h) => h.is_connected(),
            None => false,
        }
    }

    /// Symmetric teardown: closes the local channel (best-effort) and, for
    /// the listen side, cancels any outstanding pair registration so the
    /// remote observes `channel-close` then `channel-destroy` (§4.2).
    pub async fn destroy(&self, err: Option<PlexError>) {
        teardown(&self.cfg, &self.handle, &self.pair_token, err).await;
    }

    pub async fn close(&self) {
        self.destroy(None).await;
    }

    /// A disposer that outlives this `PlexDuplex` value — callers that hand
    /// the duplex's read/write halves off to a long-running task (the RPC
    /// server loop in particular) can still keep one of these around to
    /// tear the channel down from the outside, whether or not pairing has
    /// completed yet (§4.8 "a disposer that destroys the duplex").
    pub fn disposer(&self) -> DuplexDisposer {
        DuplexDisposer {
            cfg: self.cfg.clone(),
            handle: self.handle.clone(),
            pair_token: self.pair_token.clone(),
        }
    }
}

async fn teardown(cfg: &ChannelConfig, handle: &Mutex<Option<Arc<ChannelHandle>>>, pair_token: &Mutex<Option<PairToken>>, err: Option<PlexError>) {
    // Both constructors cache their handle directly now; the substrate
    // lookup is just a defensive fallback for the same race `resolve_handle`
    // guards against.
    let cached = handle.lock().unwrap().clone();
    let resolved = match cached {
        Some(h) => Some(h),
        None => crate::channel::get_channel(cfg),
    };
    if let Some(handle) = resolved {
        handle.destroy(err).await;
    }
    if let Some(token) = pair_token.lock().unwrap().take() {
        crate::channel::unpair(cfg, token);
    }
}

/// The external-disposer half of a [`PlexDuplex`] (see
/// [`PlexDuplex::disposer`]) — shares the same underlying handle/pair-token
/// cells, so destroying through either tears down the same channel exactly
/// once (`ChannelHandle::teardown` is itself idempotent).
#[derive(Clone)]
pub struct DuplexDisposer {
    cfg: ChannelConfig,
    handle: Arc<Mutex<Option<Arc<ChannelHandle>>>>,
    pair_token: Arc<Mutex<Option<PairToken>>>,
}

impl DuplexDisposer {
    pub async fn destroy(&self, err: Option<PlexError>) {
        teardown(&self.cfg, &self.handle, &self.pair_token, err).await;
    }
}
