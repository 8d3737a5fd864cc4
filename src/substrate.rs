//! The multiplex substrate: maps one transport to many `(id, protocol)`
//! sub-channels (§2 item 2, §5 "shared resources").
//!
//! This crate does not reinvent a multiplex wire format — it orchestrates
//! [`yamux`], the same substream multiplexer production Rust P2P stacks in
//! this corpus layer under their own channel abstractions (`harpc-net`
//! wraps `libp2p-yamux` the same way). A yamux connection gives us
//! anonymous, ordered, reliable byte streams; this module adds the
//! `(id, protocol)` naming and pairing handshake on top: the first frame
//! written on a freshly opened yamux stream carries the channel's id,
//! protocol name, and handshake payload, and the accepting side reads that
//! frame to decide which registered `pair()` waiter (if any) the stream
//! belongs to.
//!
//! One substrate is cached per transport identity ([`Substrate::for_transport`])
//! so concurrent [`crate::peer::Peer`]s opened over the same transport share
//! the same yamux connection, per §5.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{future, SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::{debug, trace, warn};
use yamux::{Config as YamuxConfig, Connection, Mode, Stream as YamuxStream};

use crate::channel::{ChannelId, ChannelKey, Protocol};
use crate::duplex::LifecycleEvent;
use crate::error::{PlexError, Result};

type Framing = Framed<Compat<YamuxStream>, LengthDelimitedCodec>;

/// How many inbound channel opens to buffer before a matching `pair()` is
/// registered. Oldest entries are dropped (with a warning) past this cap —
/// a caller is expected to register pairs before the remote can plausibly
/// open them.
const MAX_UNCLAIMED: usize = 256;

fn channel_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(16 * 1024 * 1024).new_codec()
}

/// Encodes the header frame sent as the very first message on a freshly
/// opened yamux stream: `id_len(u16) | id | proto_len(u16) | proto | hs_len(u32) | hs`.
fn encode_header(key: &ChannelKey, handshake: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(key.0 .0.len() as u16);
    buf.put_slice(&key.0 .0);
    buf.put_u16(key.1 .0.len() as u16);
    buf.put_slice(key.1 .0.as_bytes());
    buf.put_u32(handshake.len() as u32);
    buf.put_slice(handshake);
    buf.freeze()
}

fn decode_header(mut buf: Bytes) -> Option<(ChannelKey, Bytes)> {
    if buf.remaining() < 2 {
        return None;
    }
    let id_len = buf.get_u16() as usize;
    if buf.remaining() < id_len + 2 {
        return None;
    }
    let id = buf.copy_to_bytes(id_len);
    let proto_len = buf.get_u16() as usize;
    if buf.remaining() < proto_len + 4 {
        return None;
    }
    let proto = buf.copy_to_bytes(proto_len);
    let proto = String::from_utf8(proto.to_vec()).ok()?;
    let hs_len = buf.get_u32() as usize;
    if buf.remaining() < hs_len {
        return None;
    }
    let handshake = buf.copy_to_bytes(hs_len);
    Some(((ChannelId(id), Protocol(proto)), handshake))
}

/// A registered `pair(cfg, on_pair)` waiter.
struct PendingPair {
    events: mpsc::UnboundedSender<LifecycleEvent>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

struct SubstrateState {
    channels: HashMap<ChannelKey, Arc<ChannelHandle>>,
    pending_pairs: HashMap<ChannelKey, PendingPair>,
    unclaimed: VecDeque<(ChannelKey, Bytes, Framing)>,
}

/// Opaque token returned by [`crate::channel::pair`], passed back to
/// [`crate::channel::unpair`] to cancel the registration.
pub struct PairToken(pub(crate) ChannelKey);

/// A request to open a new outbound yamux stream, answered by whichever
/// task is driving the [`Connection`] (only one side may poll it at a time).
type OpenRequest = oneshot::Sender<Result<YamuxStream>>;

pub struct Substrate {
    open_tx: mpsc::UnboundedSender<OpenRequest>,
    state: Mutex<SubstrateState>,
}

impl Substrate {
    /// Wrap a transport in a yamux connection, spawning the background
    /// task that drives both inbound substream acceptance and outbound
    /// opens — yamux 0.11+'s `Connection` is poll-based and single-owner,
    /// so one task holds it and everyone else goes through `open_tx`.
    pub fn new<T>(io: T, mode: Mode) -> Arc<Self>
    where
        T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(io, YamuxConfig::default(), mode);
        let (open_tx, open_rx) = mpsc::unbounded_channel();
        let substrate = Arc::new(Self {
            open_tx,
            state: Mutex::new(SubstrateState {
                channels: HashMap::new(),
                pending_pairs: HashMap::new(),
                unclaimed: VecDeque::new(),
            }),
        });
        tokio::spawn(Self::drive(substrate.clone(), connection, open_rx));
        substrate
    }

    /// Per-process cache of substrates keyed by transport identity so
    /// repeated [`crate::peer::Peer`] construction over the same transport
    /// reuses one yamux connection (§5).
    pub fn for_transport<T>(key: usize, io: T, mode: Mode) -> Arc<Self>
    where
        T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
    {
        static CACHE: OnceLock<Mutex<HashMap<usize, std::sync::Weak<Substrate>>>> = OnceLock::new();
        let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = cache.lock().unwrap();
        if let Some(existing) = guard.get(&key).and_then(|w| w.upgrade()) {
            return existing;
        }
        let substrate = Self::new(io, mode);
        guard.insert(key, Arc::downgrade(&substrate));
        substrate
    }

    async fn drive<T>(substrate: Arc<Substrate>, mut connection: Connection<T>, mut open_rx: mpsc::UnboundedReceiver<OpenRequest>)
    where
        T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            tokio::select! {
                inbound = future::poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                    match inbound {
                        Some(Ok(stream)) => {
                            let substrate = substrate.clone();
                            tokio::spawn(async move {
                                substrate.accept_inbound(stream).await;
                            });
                        }
                        Some(Err(e)) => {
                            warn!(err = %e, "yamux connection error — tearing down substrate");
                            break;
                        }
                        None => {
                            debug!("yamux connection closed");
                            break;
                        }
                    }
                }
                request = open_rx.recv() => {
                    match request {
                        Some(reply) => {
                            let outbound = future::poll_fn(|cx| connection.poll_new_outbound(cx))
                                .await
                                .map_err(|e| PlexError::Substrate(e.to_string()));
                            let _ = reply.send(outbound);
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = future::poll_fn(|cx| connection.poll_close(cx)).await;
    }

    async fn accept_inbound(self: Arc<Self>, stream: YamuxStream) {
        let mut framed = Framed::new(stream.compat(), channel_codec());
        let header = match framed.next().await {
            Some(Ok(bytes)) => bytes.freeze(),
            _ => {
                trace!("inbound yamux stream closed before header frame");
                return;
            }
        };
        let Some((key, handshake)) = decode_header(header) else {
            warn!("inbound channel open with malformed header — dropping");
            return;
        };

        let waiter = {
            let mut state = self.state.lock().unwrap();
            state.pending_pairs.remove(&key)
        };

        match waiter {
            Some(waiter) => self.complete_pairing(key, handshake, framed, waiter),
            None => {
                let mut state = self.state.lock().unwrap();
                if state.unclaimed.len() >= MAX_UNCLAIMED {
                    state.unclaimed.pop_front();
                    warn!("unclaimed-channel buffer full — dropping oldest inbound open");
                }
                state.unclaimed.push_back((key, handshake, framed));
            }
        }
    }

    fn complete_pairing(
        self: &Arc<Self>,
        key: ChannelKey,
        handshake: Bytes,
        framed: Framing,
        waiter: PendingPair,
    ) {
        let handshake = if handshake.is_empty() { None } else { Some(handshake) };
        let existing = self.state.lock().unwrap().channels.get(&key).cloned();
        match existing {
            // `PlexDuplex::listen` already created this handle up front, so
            // any writes issued before the remote paired are sitting in its
            // `pending_writes` — wire the accepted stream onto the same
            // handle instead of building a fresh one so those flush in
            // order once IO starts (§4.2, §8 round-trip law).
            Some(handle) => handle.attach_incoming(framed, handshake),
            None => {
                let handle = ChannelHandle::from_accepted(self.clone(), key.clone(), framed, waiter.events.clone(), waiter.inbound);
                let _ = waiter.events.send(LifecycleEvent::RemoteOpen(handshake));
                self.state.lock().unwrap().channels.insert(key, handle);
            }
        }
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<ChannelHandle>> {
        self.state.lock().unwrap().channels.get(key).cloned()
    }

    pub fn create(
        self: &Arc<Self>,
        key: ChannelKey,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<ChannelHandle> {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        let handle = ChannelHandle::new(self.clone(), key.clone(), events, inbound);
        self.state.lock().unwrap().channels.insert(key, handle.clone());
        handle
    }

    pub fn pair(
        self: &Arc<Self>,
        key: ChannelKey,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> PairToken {
        let unclaimed = {
            let mut state = self.state.lock().unwrap();
            let mut found = None;
            for i in 0..state.unclaimed.len() {
                if state.unclaimed[i].0 == key {
                    found = Some(i);
                    break;
                }
            }
            found.map(|i| state.unclaimed.remove(i).unwrap())
        };

        if let Some((key, handshake, framed)) = unclaimed {
            self.complete_pairing(key, handshake, framed, PendingPair { events, inbound });
        } else {
            self.state
                .lock()
                .unwrap()
                .pending_pairs
                .insert(key.clone(), PendingPair { events, inbound });
        }
        PairToken(key)
    }

    pub fn unpair(&self, key: &ChannelKey, token: PairToken) {
        debug_assert_eq!(&token.0, key);
        self.state.lock().unwrap().pending_pairs.remove(key);
    }

    async fn open_stream(&self) -> Result<YamuxStream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .map_err(|_| PlexError::Substrate("yamux connection closed".to_string()))?;
        rx.await.map_err(|_| PlexError::Substrate("yamux connection closed".to_string()))?
    }

    fn remove(&self, key: &ChannelKey) {
        self.state.lock().unwrap().channels.remove(key);
    }
}

/// One multiplexed sub-channel: a yamux stream plus the `(id, protocol)`
/// framing, wired to a duplex's lifecycle-event and inbound-message
/// senders (§3 "duplex state", §4.2).
pub struct ChannelHandle {
    substrate: Arc<Substrate>,
    key: ChannelKey,
    connected: AtomicBool,
    alive: AtomicBool,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending_writes: Mutex<VecDeque<Bytes>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl ChannelHandle {
    fn new(
        substrate: Arc<Substrate>,
        key: ChannelKey,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            key,
            connected: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            events,
            out_tx: Mutex::new(None),
            pending_writes: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(Some(inbound)),
        })
    }

    fn from_accepted(
        substrate: Arc<Substrate>,
        key: ChannelKey,
        framed: Framing,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        inbound: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<Self> {
        let handle = Arc::new(Self {
            substrate,
            key,
            connected: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            events,
            out_tx: Mutex::new(None),
            pending_writes: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(None),
        });
        handle.clone().spawn_io(framed, inbound);
        handle
    }

    fn spawn_io(self: Arc<Self>, framed: Framing, inbound: mpsc::UnboundedSender<Bytes>) {
        let (sink, mut stream) = framed.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        *self.out_tx.lock().unwrap() = Some(out_tx.clone());

        for buffered in self.pending_writes.lock().unwrap().drain(..) {
            let _ = out_tx.send(buffered);
        }

        let write_handle = self.clone();
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(data) = out_rx.recv().await {
                if sink.send(data).await.is_err() {
                    write_handle.teardown(Some(PlexError::ConnectionLost)).await;
                    break;
                }
            }
        });

        let read_handle = self.clone();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(bytes)) => {
                        if inbound.send(bytes.freeze()).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(err = %e, "channel read error");
                        read_handle.teardown(Some(PlexError::Transport(e))).await;
                        break;
                    }
                    None => {
                        read_handle.teardown(None).await;
                        break;
                    }
                }
            }
        });
    }

    /// Listen-side pairing completion for a handle that already existed
    /// (created eagerly by `PlexDuplex::listen`): wires the accepted stream
    /// onto it, preserving any `pending_writes` queued by `send()` calls
    /// made before the remote paired.
    fn attach_incoming(self: &Arc<Self>, framed: Framing, handshake: Option<Bytes>) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let Some(inbound) = self.inbound.lock().unwrap().take() else {
            return;
        };
        self.connected.store(true, Ordering::Release);
        let _ = self.events.send(LifecycleEvent::RemoteOpen(handshake));
        self.clone().spawn_io(framed, inbound);
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.alive.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Connect-side open: open a fresh yamux stream, write the header
    /// frame carrying `(id, protocol, handshake)`, and start the
    /// read/write loops.
    pub async fn open(self: &Arc<Self>, handshake: Bytes) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = self.substrate.open_stream().await?;
        let mut framed = Framed::new(stream.compat(), channel_codec());
        let header = encode_header(&self.key, &handshake);
        framed
            .send(header)
            .await
            .map_err(|e| PlexError::Substrate(e.to_string()))?;

        let inbound = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .expect("open() called twice on the same connect-side channel");

        self.connected.store(true, Ordering::Release);
        let _ = self.events.send(LifecycleEvent::RemoteOpen(None));
        self.clone().spawn_io(framed, inbound);
        Ok(())
    }

    /// Buffers the write if the channel isn't open yet, sends immediately
    /// otherwise. Writes after destroy are silently dropped (§4.2).
    pub fn send(&self, data: Bytes) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let out_tx = self.out_tx.lock().unwrap().clone();
        match out_tx {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => self.pending_writes.lock().unwrap().push_back(data),
        }
    }

    /// Local close: best-effort, fans out `channel-close` then
    /// `channel-destroy` to the remote side symmetrically (§4.2).
    pub async fn close(self: &Arc<Self>) {
        self.teardown(None).await;
    }

    pub async fn destroy(self: &Arc<Self>, err: Option<PlexError>) {
        self.teardown(err).await;
    }

    async fn teardown(self: &Arc<Self>, err: Option<PlexError>) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(LifecycleEvent::Close);
        let _ = self
            .events
            .send(LifecycleEvent::Destroy(err.map(|e| e.to_string())));
        self.substrate.remove(&self.key);
    }
}
