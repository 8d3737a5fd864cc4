//! Service composition (§4.8): binds a handler object to a peer's listen
//! side, creates a client proxy on a peer's connect side, and wraps a
//! client proxy to inject a capability token into every call.

use std::sync::Arc;

use bytes::Bytes;

use crate::channel::ChannelId;
use crate::config::RpcLimits;
use crate::duplex::DuplexDisposer;
use crate::error::Result;
use crate::peer::{Peer, LANE_RPC};
use crate::rpc::client::{CallOpts, RpcClient, ScanIter};
use crate::rpc::server::{Handler, RpcServer};
use crate::rpc::wire::{
    AppendRequest, DelRequest, Envelope, GetRequest, MethodId, PutRequest, RequestPayload, ScanRequest,
};

/// Options shared by [`expose_store_port`] and [`connect_store_port`].
#[derive(Clone)]
pub struct StorePortOpts {
    pub id: ChannelId,
    /// Defaults to the `rpc` lane; a custom suffix is honored verbatim.
    pub lane: String,
    /// Eagerly wait for the channel to open before returning, rather than
    /// letting the first call observe the connect/pairing latency.
    pub eager_open: bool,
}

impl StorePortOpts {
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self { id: id.into(), lane: LANE_RPC.to_string(), eager_open: false }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = lane.into();
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager_open = true;
        self
    }
}

/// Disposer returned by [`expose_store_port`]. Dropping it leaves the
/// server running — call [`ServeHandle::dispose`] to tear it down
/// explicitly (mirrors the spec's "disposer" pattern, §4.7/§4.8).
pub struct ServeHandle {
    disposer: DuplexDisposer,
    task: tokio::task::JoinHandle<()>,
}

impl ServeHandle {
    /// Destroy the duplex (closing it symmetrically, §4.2) and wait for the
    /// server loop to observe the teardown and exit. Safe to call whether
    /// or not the remote has paired yet.
    pub async fn dispose(self) {
        self.disposer.destroy(None).await;
        let _ = self.task.await;
    }

    /// Abort the server loop without a symmetric close handshake — only
    /// for shutdown paths where the transport is already gone.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Opens a listen lane on `peer` and serves `handler` over it (§4.8). Does
/// not wait for the remote to pair — pairing and dispatch both happen in
/// the background server task; the returned [`ServeHandle`] can dispose of
/// the channel regardless of whether pairing has completed yet.
///
/// `opts.eager_open` is honored by blocking until pairing completes before
/// this call returns, for callers that want to observe "a client is
/// connected" before proceeding (e.g. before signalling readiness
/// elsewhere).
pub async fn expose_store_port(peer: &Peer, opts: StorePortOpts, handler: Arc<dyn Handler>) -> Result<ServeHandle> {
    expose_store_port_with_limits(peer, opts, handler, RpcLimits::from_env()).await
}

pub async fn expose_store_port_with_limits(
    peer: &Peer,
    opts: StorePortOpts,
    handler: Arc<dyn Handler>,
    limits: RpcLimits,
) -> Result<ServeHandle> {
    let eager = opts.eager_open;
    let mut duplex = peer.listen_lane(opts.id, &opts.lane);
    let disposer = duplex.disposer();

    if eager {
        loop {
            if duplex.channel_handle().await.is_ok() {
                break;
            }
            match duplex.next_event().await {
                Some(crate::duplex::LifecycleEvent::RemoteOpen(_)) => break,
                Some(crate::duplex::LifecycleEvent::Destroy(_)) | None => {
                    return Err(crate::error::PlexError::ChannelDestroyed)
                }
                _ => continue,
            }
        }
    }

    let server = RpcServer::with_limits(duplex, handler, limits);
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    Ok(ServeHandle { disposer, task })
}

/// Opens a connect lane on `peer` and returns a client proxy bound to it
/// (§4.8).
pub async fn connect_store_port(peer: &Peer, opts: StorePortOpts) -> Result<RpcClient> {
    connect_store_port_with_limits(peer, opts, RpcLimits::from_env()).await
}

pub async fn connect_store_port_with_limits(peer: &Peer, opts: StorePortOpts, limits: RpcLimits) -> Result<RpcClient> {
    let duplex = peer.connect_lane(opts.id, &opts.lane).await?;
    RpcClient::with_limits(duplex, limits).await
}

/// Wraps a client proxy so every call carries `caps = token`, overriding
/// any caller-supplied capability token (§4.8).
pub struct CapsClient {
    inner: Arc<RpcClient>,
    token: Bytes,
}

impl CapsClient {
    pub fn new(inner: Arc<RpcClient>, token: impl Into<Bytes>) -> Self {
        Self { inner, token: token.into() }
    }

    fn inject(&self, req: RequestPayload) -> RequestPayload {
        req.with_caps(self.token.clone())
    }

    pub async fn get(&self, req: GetRequest, opts: CallOpts) -> Result<Envelope> {
        match self.inject(RequestPayload::Get(req)) {
            RequestPayload::Get(r) => self.inner.get(r, opts).await,
            _ => unreachable!(),
        }
    }

    pub async fn put(&self, req: PutRequest, opts: CallOpts) -> Result<Envelope> {
        match self.inject(RequestPayload::Put(req)) {
            RequestPayload::Put(r) => self.inner.put(r, opts).await,
            _ => unreachable!(),
        }
    }

    pub async fn del(&self, req: DelRequest, opts: CallOpts) -> Result<Envelope> {
        match self.inject(RequestPayload::Del(req)) {
            RequestPayload::Del(r) => self.inner.del(r, opts).await,
            _ => unreachable!(),
        }
    }

    pub async fn append(&self, req: AppendRequest, opts: CallOpts) -> Result<Envelope> {
        match self.inject(RequestPayload::Append(req)) {
            RequestPayload::Append(r) => self.inner.append(r, opts).await,
            _ => unreachable!(),
        }
    }

    pub async fn scan(&self, req: ScanRequest, opts: CallOpts) -> Result<ScanIter> {
        match self.inject(RequestPayload::Scan(req)) {
            RequestPayload::Scan(r) => self.inner.scan(r, opts).await,
            _ => unreachable!(),
        }
    }

    pub async fn call(&self, method: MethodId, req: RequestPayload, opts: CallOpts) -> Result<Envelope> {
        self.inner.call(method, self.inject(req), opts).await
    }
}

/// `with-caps(proxy, token)` (§4.8) — the free-function spelling, for
/// callers that prefer it over [`CapsClient::new`].
pub fn with_caps(proxy: Arc<RpcClient>, token: impl Into<Bytes>) -> CapsClient {
    CapsClient::new(proxy, token)
}
