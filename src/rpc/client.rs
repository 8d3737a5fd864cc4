//! RPC client proxy (§4.6): request id assignment, route tracking,
//! per-call timers, cancellation (explicit, abort-signal, timeout),
//! and the pull-model `scan` iterator.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::RpcLimits;
use crate::duplex::{LifecycleEvent, PlexDuplex};
use crate::error::{ErrorCode, PlexError, Result};
use crate::substrate::ChannelHandle;

use super::wire::{AppendRequest, DelRequest, Envelope, Frame, GetRequest, MethodId, PutRequest, RequestPayload, ScanRequest};

/// An abort signal a caller can fire mid-call (§4.6 step 6, §5
/// "cancellation"). `AbortHandle::abort` is the caller-visible trigger;
/// `AbortSignal` is what the client proxy polls internally.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    token: CancellationToken,
    reason: Mutex<Option<AbortReason>>,
}

#[derive(Debug, Clone)]
pub enum AbortReason {
    /// The caller's reason carried a recognised `Timeout` code.
    Timeout,
    /// Any other reason string (delivered as `{Destroyed, reason}`).
    Custom(String),
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner { token: CancellationToken::new(), reason: Mutex::new(None) }),
        }
    }

    pub fn abort(&self, reason: AbortReason) {
        *self.inner.reason.lock().unwrap() = Some(reason);
        self.inner.token.cancel();
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal { inner: self.inner.clone() }
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

impl AbortSignal {
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    fn reason(&self) -> AbortReason {
        self.inner.reason.lock().unwrap().clone().unwrap_or(AbortReason::Custom(String::new()))
    }
}

/// Per-call options (§4.6 step 2 — `signal`/`timeoutMs` are transport-only
/// fields, never part of the request payload itself).
#[derive(Clone, Default)]
pub struct CallOpts {
    pub timeout: Option<Duration>,
    pub signal: Option<AbortSignal>,
}

impl CallOpts {
    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn with_signal(mut self, s: AbortSignal) -> Self {
        self.signal = Some(s);
        self
    }
}

enum RouteKind {
    Unary(oneshot::Sender<std::result::Result<Envelope, PlexError>>),
    Stream(mpsc::UnboundedSender<StreamMsg>),
}

enum StreamMsg {
    Item(Envelope),
    Done,
    Err(PlexError),
}

struct RouteEntry {
    kind: RouteKind,
    cancel_sent: Arc<AtomicBool>,
}

type RouteMap = Arc<Mutex<HashMap<u32, RouteEntry>>>;
type RecentlyClosed = Arc<Mutex<HashMap<u32, Instant>>>;

/// Client-side proxy over one RPC duplex (§4.6).
pub struct RpcClient {
    handle: Arc<ChannelHandle>,
    routes: RouteMap,
    recently_closed: RecentlyClosed,
    next_rid: AtomicU32,
    limits: RpcLimits,
    alive: Arc<AtomicBool>,
    /// `PLEX_RPC_TRACE` — non-semantic, read once at construction (§6).
    trace: bool,
}

impl RpcClient {
    pub async fn new(duplex: PlexDuplex) -> Result<Self> {
        Self::with_limits(duplex, RpcLimits::from_env()).await
    }

    pub async fn with_limits(mut duplex: PlexDuplex, limits: RpcLimits) -> Result<Self> {
        let handle = duplex.channel_handle().await?;
        let routes: RouteMap = Arc::new(Mutex::new(HashMap::new()));
        let recently_closed: RecentlyClosed = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let bg_routes = routes.clone();
        let bg_recent = recently_closed.clone();
        let bg_alive = alive.clone();
        let orphan_ttl = limits.orphan_ttl;
        let trace = crate::config::trace_enabled("PLEX_RPC_TRACE");
        tokio::spawn(async move {
            Self::run_reader(&mut duplex, &bg_routes, &bg_recent, orphan_ttl, trace).await;
            bg_alive.store(false, Ordering::SeqCst);
            let mut guard = bg_routes.lock().unwrap();
            for (_, entry) in guard.drain() {
                Self::complete_route(entry, Err(PlexError::ConnectionLost));
            }
        });

        Ok(Self { handle, routes, recently_closed, next_rid: AtomicU32::new(0), limits, alive, trace })
    }

    async fn run_reader(duplex: &mut PlexDuplex, routes: &RouteMap, recently_closed: &RecentlyClosed, orphan_ttl: Duration, trace: bool) {
        loop {
            tokio::select! {
                frame = duplex.recv() => {
                    match frame {
                        Some(bytes) => {
                            if trace {
                                tracing::trace!(len = bytes.len(), "rpc client: frame received");
                            }
                            Self::on_frame(bytes, routes, recently_closed, orphan_ttl);
                        }
                        None => {
                            debug!("rpc client: duplex closed");
                            break;
                        }
                    }
                }
                event = duplex.next_event() => {
                    match event {
                        Some(LifecycleEvent::Destroy(reason)) => {
                            debug!(?reason, "rpc client: channel destroyed");
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }
    }

    fn on_frame(bytes: Bytes, routes: &RouteMap, recently_closed: &RecentlyClosed, orphan_ttl: Duration) {
        let frame = match Frame::decode(bytes) {
            Ok(f) => f,
            Err(_) => {
                warn!("rpc client: undecodable frame, dropping");
                return;
            }
        };
        let Frame::Response { rid, more, payload, .. } = frame else {
            warn!("rpc client: unexpected non-response frame, dropping");
            return;
        };

        let entry = routes.lock().unwrap().remove(&rid);
        let Some(entry) = entry else {
            let now = Instant::now();
            let within_ttl = recently_closed.lock().unwrap().get(&rid).map(|exp| now < *exp).unwrap_or(false);
            if within_ttl {
                trace!(rid, "rpc client: orphan response within recently-closed TTL");
            } else {
                warn!(rid, "rpc client: orphan response for unknown route");
            }
            return;
        };

        if more {
            // Non-terminal: only streams expect this. Re-insert the route,
            // deliver the envelope, and keep waiting for the terminal frame.
            if let RouteKind::Stream(tx) = &entry.kind {
                match Envelope::decode(payload) {
                    Ok(env) => {
                        let _ = tx.send(StreamMsg::Item(env));
                    }
                    Err(_) => {
                        let _ = tx.send(StreamMsg::Item(Envelope::err(ErrorCode::Unknown, "bad response payload")));
                    }
                }
                routes.lock().unwrap().insert(rid, entry);
            } else {
                warn!(rid, "rpc client: unary route received a non-terminal frame, ignoring");
                routes.lock().unwrap().insert(rid, entry);
            }
            return;
        }

        // Terminal.
        recently_closed.lock().unwrap().insert(rid, Instant::now() + orphan_ttl);
        match entry.kind {
            RouteKind::Unary(tx) => {
                let env = if payload.is_empty() {
                    Envelope::ok()
                } else {
                    Envelope::decode(payload).unwrap_or_else(|_| Envelope::err(ErrorCode::Unknown, "bad response payload"))
                };
                let _ = tx.send(Ok(env));
            }
            RouteKind::Stream(tx) => {
                if !payload.is_empty() {
                    let env = Envelope::decode(payload).unwrap_or_else(|_| Envelope::err(ErrorCode::Unknown, "bad response payload"));
                    let _ = tx.send(StreamMsg::Item(env));
                }
                let _ = tx.send(StreamMsg::Done);
            }
        }
    }

    fn complete_route(entry: RouteEntry, outcome: std::result::Result<Envelope, PlexError>) {
        match entry.kind {
            RouteKind::Unary(tx) => {
                let _ = tx.send(outcome);
            }
            RouteKind::Stream(tx) => match outcome {
                Ok(env) => {
                    let _ = tx.send(StreamMsg::Item(env));
                    let _ = tx.send(StreamMsg::Done);
                }
                Err(e) => {
                    let _ = tx.send(StreamMsg::Err(e));
                }
            },
        }
    }

    fn next_rid(&self) -> u32 {
        self.next_rid.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn terminate_route(
        rid: u32,
        method: MethodId,
        handle: &Arc<ChannelHandle>,
        routes: &RouteMap,
        recently_closed: &RecentlyClosed,
        orphan_ttl: Duration,
        cancel_sent: &AtomicBool,
        outcome: std::result::Result<Envelope, PlexError>,
    ) {
        let entry = routes.lock().unwrap().remove(&rid);
        if let Some(entry) = entry {
            if !cancel_sent.swap(true, Ordering::SeqCst) {
                handle.send(Frame::Cancel { rid, method }.encode());
            }
            recently_closed.lock().unwrap().insert(rid, Instant::now() + orphan_ttl);
            Self::complete_route(entry, outcome);
        }
    }

    async fn call_unary(&self, method: MethodId, req: RequestPayload, opts: CallOpts) -> Result<Envelope> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(PlexError::ConnectionLost);
        }
        if self.limits.max_client_routes != 0 && self.routes.lock().unwrap().len() >= self.limits.max_client_routes {
            warn!(method = method.name(), limit = self.limits.max_client_routes, "rpc client: in-flight limit reached — resetting transport");
            self.handle.destroy(Some(PlexError::TooManyRoutes)).await;
            return Err(PlexError::TooManyRoutes);
        }

        let payload = req.encode();
        if payload.len() > self.limits.max_request_bytes {
            return Err(PlexError::PayloadTooLarge { len: payload.len(), max: self.limits.max_request_bytes });
        }

        let rid = self.next_rid();
        let cancel_sent = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        self.routes.lock().unwrap().insert(rid, RouteEntry { kind: RouteKind::Unary(tx), cancel_sent: cancel_sent.clone() });
        self.handle.send(Frame::Request { rid, method, payload }.encode());

        let timeout = opts.timeout.or(self.limits.client_timeout);
        let timeout_task = timeout.map(|dur| {
            let handle = self.handle.clone();
            let routes = self.routes.clone();
            let recently_closed = self.recently_closed.clone();
            let cancel_sent = cancel_sent.clone();
            let orphan_ttl = self.limits.orphan_ttl;
            tokio::spawn(async move {
                tokio::time::sleep(dur).await;
                Self::terminate_route(
                    rid,
                    method,
                    &handle,
                    &routes,
                    &recently_closed,
                    orphan_ttl,
                    &cancel_sent,
                    Ok(Envelope::err(ErrorCode::Timeout, format!("Request timed out after {}ms", dur.as_millis()))),
                );
            })
        });

        let abort_task = opts.signal.map(|signal| {
            let handle = self.handle.clone();
            let routes = self.routes.clone();
            let recently_closed = self.recently_closed.clone();
            let cancel_sent = cancel_sent.clone();
            let orphan_ttl = self.limits.orphan_ttl;
            tokio::spawn(async move {
                signal.cancelled().await;
                let outcome = match signal.reason() {
                    AbortReason::Timeout => Envelope::err(ErrorCode::Timeout, "aborted"),
                    AbortReason::Custom(reason) => Envelope::err(ErrorCode::Destroyed, reason),
                };
                Self::terminate_route(rid, method, &handle, &routes, &recently_closed, orphan_ttl, &cancel_sent, Ok(outcome));
            })
        });

        if let Some(stall) = self.limits.stall_warn {
            Self::spawn_stall_warn(rid, method, stall, self.routes.clone());
        }
        if let Some(pending) = self.limits.pending_log {
            Self::spawn_pending_log(rid, method, pending, self.routes.clone());
        }

        let result = rx.await.unwrap_or(Err(PlexError::ConnectionLost));
        if let Some(t) = timeout_task {
            t.abort();
        }
        if let Some(t) = abort_task {
            t.abort();
        }
        result
    }

    fn spawn_stall_warn(rid: u32, method: MethodId, after: Duration, routes: RouteMap) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if routes.lock().unwrap().contains_key(&rid) {
                warn!(rid, method = method.name(), "rpc client: call has not completed within stall-warn window");
            }
        });
    }

    fn spawn_pending_log(rid: u32, method: MethodId, every: Duration, routes: RouteMap) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if !routes.lock().unwrap().contains_key(&rid) {
                    break;
                }
                debug!(rid, method = method.name(), "rpc client: call still pending");
            }
        });
    }

    /// Generic unary call, keyed by method id — used directly by callers
    /// that already have a typed request (the peer pool in particular,
    /// which is method-agnostic).
    pub async fn call(&self, method: MethodId, req: RequestPayload, opts: CallOpts) -> Result<Envelope> {
        self.call_unary(method, req, opts).await
    }

    pub async fn get(&self, req: GetRequest, opts: CallOpts) -> Result<Envelope> {
        self.call_unary(MethodId::Get, RequestPayload::Get(req), opts).await
    }

    pub async fn put(&self, req: PutRequest, opts: CallOpts) -> Result<Envelope> {
        self.call_unary(MethodId::Put, RequestPayload::Put(req), opts).await
    }

    pub async fn del(&self, req: DelRequest, opts: CallOpts) -> Result<Envelope> {
        self.call_unary(MethodId::Del, RequestPayload::Del(req), opts).await
    }

    pub async fn append(&self, req: AppendRequest, opts: CallOpts) -> Result<Envelope> {
        self.call_unary(MethodId::Append, RequestPayload::Append(req), opts).await
    }

    pub async fn scan(&self, req: ScanRequest, opts: CallOpts) -> Result<ScanIter> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(PlexError::ConnectionLost);
        }
        if self.limits.max_client_routes != 0 && self.routes.lock().unwrap().len() >= self.limits.max_client_routes {
            warn!(method = "scan", limit = self.limits.max_client_routes, "rpc client: in-flight limit reached — resetting transport");
            self.handle.destroy(Some(PlexError::TooManyRoutes)).await;
            return Err(PlexError::TooManyRoutes);
        }

        let payload = RequestPayload::Scan(req).encode();
        if payload.len() > self.limits.max_request_bytes {
            return Err(PlexError::PayloadTooLarge { len: payload.len(), max: self.limits.max_request_bytes });
        }

        let rid = self.next_rid();
        let cancel_sent = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(rid, RouteEntry { kind: RouteKind::Stream(tx), cancel_sent: cancel_sent.clone() });
        self.handle.send(Frame::Request { rid, method: MethodId::Scan, payload }.encode());

        let mut timers = Vec::new();
        let timeout = opts.timeout.or(self.limits.client_timeout);
        if let Some(dur) = timeout {
            let handle = self.handle.clone();
            let routes = self.routes.clone();
            let recently_closed = self.recently_closed.clone();
            let cancel_sent = cancel_sent.clone();
            let orphan_ttl = self.limits.orphan_ttl;
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(dur).await;
                Self::terminate_route(
                    rid,
                    MethodId::Scan,
                    &handle,
                    &routes,
                    &recently_closed,
                    orphan_ttl,
                    &cancel_sent,
                    Err(PlexError::Timeout(dur.as_millis() as u64)),
                );
            }));
        }
        if let Some(signal) = opts.signal {
            let handle = self.handle.clone();
            let routes = self.routes.clone();
            let recently_closed = self.recently_closed.clone();
            let cancel_sent = cancel_sent.clone();
            let orphan_ttl = self.limits.orphan_ttl;
            timers.push(tokio::spawn(async move {
                signal.cancelled().await;
                let err = match signal.reason() {
                    AbortReason::Timeout => PlexError::Timeout(0),
                    AbortReason::Custom(reason) => PlexError::Destroyed(reason),
                };
                Self::terminate_route(rid, MethodId::Scan, &handle, &routes, &recently_closed, orphan_ttl, &cancel_sent, Err(err));
            }));
        }

        Ok(ScanIter {
            rid,
            method: MethodId::Scan,
            handle: self.handle.clone(),
            routes: self.routes.clone(),
            recently_closed: self.recently_closed.clone(),
            orphan_ttl: self.limits.orphan_ttl,
            cancel_sent,
            rx,
            timers,
            done: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.handle.is_connected()
    }

    /// Best-effort close: tears down the underlying channel. Pending routes
    /// observe the transport-teardown path (§4.6 "transport teardown").
    pub async fn close(&self) {
        self.handle.close().await;
    }

    pub async fn destroy(&self) {
        self.handle.destroy(None).await;
    }
}

/// Pull-model async iterator over `scan` results (§4.6 "stream iterator",
/// §9 "producer-consumer channel with next/return/throw semantics").
pub struct ScanIter {
    rid: u32,
    method: MethodId,
    handle: Arc<ChannelHandle>,
    routes: RouteMap,
    recently_closed: RecentlyClosed,
    orphan_ttl: Duration,
    cancel_sent: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    timers: Vec<tokio::task::JoinHandle<()>>,
    done: bool,
}

impl ScanIter {
    /// Buffered envelopes first; `None` once the producer signals done or
    /// after the first error is propagated.
    pub async fn next(&mut self) -> Option<Result<Envelope>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamMsg::Item(env)) => Some(Ok(env)),
            Some(StreamMsg::Done) | None => {
                self.done = true;
                None
            }
            Some(StreamMsg::Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    /// Sends a cancel frame (at most once) and closes the route — no
    /// further envelopes are yielded after this returns (§8 invariant).
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.cleanup();
    }

    /// Alias matching the spec's `return()` naming (not a Rust keyword, so
    /// spelled out).
    pub fn close(&mut self) {
        self.cancel();
    }

    /// Equivalent to `cancel()` — the caller already has the error it wants
    /// to surface upstream; this just stops the producer.
    pub fn throw(&mut self) {
        self.cancel();
    }

    fn cleanup(&self) {
        for t in &self.timers {
            t.abort();
        }
        if let Some(_entry) = self.routes.lock().unwrap().remove(&self.rid) {
            if !self.cancel_sent.swap(true, Ordering::SeqCst) {
                self.handle.send(Frame::Cancel { rid: self.rid, method: self.method }.encode());
            }
            self.recently_closed.lock().unwrap().insert(self.rid, Instant::now() + self.orphan_ttl);
        }
    }
}

impl Drop for ScanIter {
    fn drop(&mut self) {
        if !self.done {
            self.cleanup();
        }
    }
}
