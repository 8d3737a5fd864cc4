//! Peer pool (§4.7): selects an eligible peer per call, routes through its
//! RPC lane, and tracks EWMA latency and failure cooldowns.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::channel::ChannelId;
use crate::config::RpcLimits;
use crate::error::{PlexError, Result};
use crate::peer::Peer;
use crate::rpc::client::{CallOpts, RpcClient, ScanIter};
use crate::rpc::wire::{Envelope, MethodId, RequestPayload, ScanRequest};

const EWMA_ALPHA: f64 = 0.2;
const COOLDOWN_ON_FAILURE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Lan,
    Wan,
}

impl Locality {
    fn weight(self) -> f64 {
        match self {
            Locality::Local => 8.0,
            Locality::Lan => 4.0,
            Locality::Wan => 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerMeta {
    pub source: Option<String>,
    pub locality: Option<Locality>,
}

/// The selection policy used by [`PeerPool::select`] (§4.7 "Policies").
#[derive(Clone)]
pub enum Policy {
    RoundRobin,
    Weighted,
    /// Sticky-by-key — the caller has already computed `opts.sticky_key`
    /// from its own `keyFn(opts)` equivalent before calling in.
    StickyByKey,
}

/// Per-call selection hints (§4.7 effective-weight formula, sticky key).
#[derive(Clone, Default)]
pub struct PoolCallOpts {
    pub sticky_key: Option<bytes::Bytes>,
    pub prefer_local: bool,
}

#[derive(Debug, Clone)]
pub struct PeerStats {
    pub id: u64,
    pub weight: u32,
    pub locality: Option<Locality>,
    pub in_flight: u64,
    pub failures: u64,
    pub successes: u64,
    pub latency_ms: f64,
    pub cooling_down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    NoPeer,
    Complete,
    Error,
}

/// The pool's public event stream (§9 "observer interface").
#[derive(Debug, Clone)]
pub enum PoolEvent {
    PeerStats(PeerStats),
    Call { kind: CallKind },
}

type LaneKey = (ChannelId, String);

struct PoolPeerEntry {
    id: u64,
    peer: Arc<Peer>,
    weight: u32,
    meta: PeerMeta,
    in_flight: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    latency_ms: Mutex<f64>,
    cooldown_until: Mutex<Instant>,
    clients: Mutex<HashMap<LaneKey, Arc<RpcClient>>>,
}

impl PoolPeerEntry {
    fn new(id: u64, peer: Arc<Peer>, weight: u32, meta: PeerMeta) -> Self {
        Self {
            id,
            peer,
            weight: weight.max(1),
            meta,
            in_flight: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            latency_ms: Mutex::new(0.0),
            cooldown_until: Mutex::new(Instant::now()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        now >= *self.cooldown_until.lock().unwrap()
    }

    fn effective_weight(&self, prefer_local: bool) -> f64 {
        let locality = self.meta.locality.unwrap_or(Locality::Wan);
        let mut w = self.weight as f64 * locality.weight();
        if prefer_local && locality == Locality::Local {
            w *= 2.0;
        }
        let failures = self.failures.load(Ordering::Relaxed) as f64;
        w /= 1.0 + failures;
        let latency = *self.latency_ms.lock().unwrap();
        w /= 1.0 + latency / 20.0;
        w.max(0.0001)
    }

    async fn client_for(&self, id: ChannelId, lane: &str, limits: &RpcLimits) -> Result<Arc<RpcClient>> {
        let key: LaneKey = (id.clone(), lane.to_string());
        if let Some(existing) = self.clients.lock().unwrap().get(&key).cloned() {
            return Ok(existing);
        }
        let duplex = if lane == crate::peer::LANE_RPC {
            self.peer.connect_rpc(id.clone()).await?
        } else {
            self.peer.connect_lane(id.clone(), lane).await?
        };
        let client = Arc::new(RpcClient::with_limits(duplex, limits.clone()).await?);
        let mut guard = self.clients.lock().unwrap();
        let client = guard.entry(key).or_insert_with(|| client.clone()).clone();
        Ok(client)
    }

    fn record(&self, result: &Result<Envelope>, elapsed_ms: f64) {
        {
            let mut lat = self.latency_ms.lock().unwrap();
            *lat = *lat * (1.0 - EWMA_ALPHA) + elapsed_ms * EWMA_ALPHA;
        }
        match result {
            Ok(env) if env.is_ok() => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                *self.cooldown_until.lock().unwrap() = Instant::now() + COOLDOWN_ON_FAILURE;
            }
        }
    }

    fn record_stream_outcome(&self, last_ok: Option<bool>, errored: bool) {
        if errored {
            self.failures.fetch_add(1, Ordering::Relaxed);
            *self.cooldown_until.lock().unwrap() = Instant::now() + COOLDOWN_ON_FAILURE;
        } else if last_ok.unwrap_or(true) {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> PeerStats {
        PeerStats {
            id: self.id,
            weight: self.weight,
            locality: self.meta.locality,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            latency_ms: *self.latency_ms.lock().unwrap(),
            cooling_down: Instant::now() < *self.cooldown_until.lock().unwrap(),
        }
    }

    async fn close_all(&self) {
        let clients: Vec<_> = self.clients.lock().unwrap().values().cloned().collect();
        for c in clients {
            c.close().await;
        }
    }

    async fn destroy_all(&self) {
        let clients: Vec<_> = self.clients.lock().unwrap().values().cloned().collect();
        for c in clients {
            c.destroy().await;
        }
    }
}

fn djb2(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// A set of weighted peers, balanced per [`Policy`] (§4.7).
pub struct PeerPool {
    entries: Mutex<Vec<Arc<PoolPeerEntry>>>,
    next_id: AtomicU64,
    rr_counter: AtomicUsize,
    events_tx: broadcast::Sender<PoolEvent>,
    limits: RpcLimits,
    /// `PLEX_POOL_TRACE` — non-semantic, read once at construction (§6).
    trace: bool,
}

impl Default for PeerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerPool {
    pub fn new() -> Self {
        Self::with_limits(RpcLimits::from_env())
    }

    pub fn with_limits(limits: RpcLimits) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            rr_counter: AtomicUsize::new(0),
            events_tx,
            limits,
            trace: crate::config::trace_enabled("PLEX_POOL_TRACE"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Returns the pool-internal id; pass it to [`PeerPool::remove`] to
    /// dispose of this peer (the Rust rendering of the spec's "disposer").
    pub fn add(&self, peer: Arc<Peer>, weight: u32, meta: PeerMeta) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(Arc::new(PoolPeerEntry::new(id, peer, weight, meta)));
        debug!(id, "pool: peer added");
        id
    }

    pub async fn remove(&self, id: u64) {
        let removed = {
            let mut guard = self.entries.lock().unwrap();
            guard.iter().position(|e| e.id == id).map(|i| guard.remove(i))
        };
        if let Some(entry) = removed {
            entry.destroy_all().await;
            debug!(id, "pool: peer removed");
        }
    }

    pub async fn close(&self) {
        let entries: Vec<_> = self.entries.lock().unwrap().clone();
        for entry in entries {
            entry.close_all().await;
        }
    }

    pub async fn destroy(&self) {
        let entries: Vec<_> = self.entries.lock().unwrap().clone();
        for entry in entries {
            entry.destroy_all().await;
        }
    }

    pub fn stats(&self) -> Vec<PeerStats> {
        self.entries.lock().unwrap().iter().map(|e| e.stats()).collect()
    }

    fn eligible(&self) -> Vec<Arc<PoolPeerEntry>> {
        let now = Instant::now();
        self.entries.lock().unwrap().iter().filter(|e| e.is_eligible(now)).cloned().collect()
    }

    fn select(&self, policy: &Policy, opts: &PoolCallOpts) -> Result<Arc<PoolPeerEntry>> {
        let eligible = self.eligible();
        if eligible.is_empty() {
            let _ = self.events_tx.send(PoolEvent::Call { kind: CallKind::NoPeer });
            return Err(PlexError::NoPeerAvailable);
        }
        let chosen = match policy {
            Policy::RoundRobin => {
                let i = self.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible[i].clone()
            }
            Policy::Weighted => {
                let weights: Vec<f64> = eligible.iter().map(|e| e.effective_weight(opts.prefer_local)).collect();
                let total: f64 = weights.iter().sum();
                let mut target = rand::thread_rng().gen_range(0.0..total.max(f64::MIN_POSITIVE));
                let mut chosen = eligible.last().unwrap().clone();
                for (entry, w) in eligible.iter().zip(weights.iter()) {
                    if target < *w {
                        chosen = entry.clone();
                        break;
                    }
                    target -= w;
                }
                chosen
            }
            Policy::StickyByKey => match &opts.sticky_key {
                Some(key) if !key.is_empty() => {
                    let hash = djb2(key);
                    eligible[(hash as usize) % eligible.len()].clone()
                }
                _ => {
                    let i = self.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                    eligible[i].clone()
                }
            },
        };
        if self.trace {
            trace!(id = chosen.id, in_flight = chosen.in_flight.load(Ordering::Relaxed), "pool: selected peer");
        }
        Ok(chosen)
    }

    fn emit_stats(&self, entry: &PoolPeerEntry) {
        let _ = self.events_tx.send(PoolEvent::PeerStats(entry.stats()));
    }

    /// A unary call through the pool: select a peer, route via its cached
    /// client for `(id, lane)`, update health stats (§4.7 "per-call
    /// bookkeeping").
    pub async fn call(
        &self,
        policy: &Policy,
        pool_opts: &PoolCallOpts,
        id: ChannelId,
        lane: &str,
        method: MethodId,
        req: RequestPayload,
        call_opts: CallOpts,
    ) -> Result<Envelope> {
        let entry = self.select(policy, pool_opts)?;
        let client = entry.client_for(id, lane, &self.limits).await?;

        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = client.call(method, req, call_opts).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        entry.record(&result, elapsed_ms);
        entry.in_flight.fetch_sub(1, Ordering::Relaxed);

        self.emit_stats(&entry);
        let kind = if result.is_ok() { CallKind::Complete } else { CallKind::Error };
        let _ = self.events_tx.send(PoolEvent::Call { kind });
        result
    }

    /// A streaming `scan` call through the pool. Bookkeeping happens as the
    /// returned iterator is driven to completion (or dropped) rather than
    /// up front (§4.7 "as unary but bookkeeping fires in a finally").
    pub async fn scan(
        &self,
        policy: &Policy,
        pool_opts: &PoolCallOpts,
        id: ChannelId,
        lane: &str,
        req: ScanRequest,
        call_opts: CallOpts,
    ) -> Result<PooledScanIter> {
        let entry = self.select(policy, pool_opts)?;
        let client = entry.client_for(id, lane, &self.limits).await?;

        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let inner = match client.scan(req, call_opts).await {
            Ok(iter) => iter,
            Err(e) => {
                entry.in_flight.fetch_sub(1, Ordering::Relaxed);
                entry.record_stream_outcome(None, true);
                self.emit_stats(&entry);
                let _ = self.events_tx.send(PoolEvent::Call { kind: CallKind::Error });
                return Err(e);
            }
        };

        Ok(PooledScanIter {
            inner,
            entry,
            events_tx: self.events_tx.clone(),
            start,
            last_ok: None,
            finished: false,
        })
    }
}

/// A `scan` iterator routed through the pool — wraps [`ScanIter`] with the
/// peer's in-flight counter and EWMA bookkeeping, finalized once (on
/// completion, error, or drop).
pub struct PooledScanIter {
    inner: ScanIter,
    entry: Arc<PoolPeerEntry>,
    events_tx: broadcast::Sender<PoolEvent>,
    start: Instant,
    last_ok: Option<bool>,
    finished: bool,
}

impl PooledScanIter {
    pub async fn next(&mut self) -> Option<Result<Envelope>> {
        let item = self.inner.next().await;
        match &item {
            Some(Ok(env)) => self.last_ok = Some(env.is_ok()),
            Some(Err(_)) => self.finish(true),
            None => self.finish(false),
        }
        item
    }

    pub fn cancel(&mut self) {
        self.inner.cancel();
        self.finish(false);
    }

    fn finish(&mut self, errored: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.entry.record_stream_outcome(self.last_ok, errored);
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        trace!(elapsed_ms = elapsed, "pool: scan finished");
        let _ = self.events_tx.send(PoolEvent::PeerStats(self.entry.stats()));
        let kind = if errored { CallKind::Error } else { CallKind::Complete };
        let _ = self.events_tx.send(PoolEvent::Call { kind });
    }
}

impl Drop for PooledScanIter {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false);
        }
    }
}
