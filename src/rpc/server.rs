//! RPC server (§4.5): decode frames, dispatch to a handler table, stream
//! `scan` results, enforce server-side limits.
//!
//! The "dynamic handler table" design note in spec.md §9 maps directly onto
//! default trait methods: [`Handler::get`]/`put`/`del`/`append` default to
//! `None` ("not implemented"), and the dispatch loop turns that into the
//! canonical `{Unknown, "Unknown method"}` envelope itself — there's no
//! separate capability-query step.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::RpcLimits;
use crate::duplex::{LifecycleEvent, PlexDuplex};
use crate::error::{ErrorCode, Result};
use crate::substrate::ChannelHandle;

use super::wire::{AppendRequest, DelRequest, Envelope, Frame, GetRequest, MethodId, PutRequest, RequestPayload, ScanRequest};

/// A `scan` implementation yields envelopes as they're produced; the server
/// sends each as a `more=1` response and a terminal `more=0` once the
/// stream ends (§4.4, §4.5 "scan contract").
pub type ScanStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// A handler object implementing any subset of `{get, put, del, append,
/// scan}` (§4.5). Unimplemented methods default to `None`, which the
/// server turns into `{Unknown, "Unknown method"}` at dispatch time.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn get(&self, _req: GetRequest) -> Option<Envelope> {
        None
    }

    async fn put(&self, _req: PutRequest) -> Option<Envelope> {
        None
    }

    async fn del(&self, _req: DelRequest) -> Option<Envelope> {
        None
    }

    async fn append(&self, _req: AppendRequest) -> Option<Envelope> {
        None
    }

    async fn scan(&self, _req: ScanRequest) -> Option<ScanStream> {
        None
    }
}

type InflightMap = Arc<Mutex<HashMap<u32, CancellationToken>>>;

/// Reads frames off one duplex, dispatches to a [`Handler`], writes
/// responses. One server instance serves exactly one duplex (§4.5).
pub struct RpcServer {
    duplex: PlexDuplex,
    handler: Arc<dyn Handler>,
    limits: RpcLimits,
    /// `PLEX_RPC_TRACE` — non-semantic, read once at construction (§6).
    trace: bool,
}

impl RpcServer {
    pub fn new(duplex: PlexDuplex, handler: Arc<dyn Handler>) -> Self {
        Self::with_limits(duplex, handler, RpcLimits::from_env())
    }

    pub fn with_limits(duplex: PlexDuplex, handler: Arc<dyn Handler>, limits: RpcLimits) -> Self {
        Self { duplex, handler, limits, trace: crate::config::trace_enabled("PLEX_RPC_TRACE") }
    }

    /// Drive the server to completion — returns once the transport tears
    /// down. Every inflight request gets its own task so a slow `scan`
    /// never blocks unrelated unary calls (§5 "messages delivered in order
    /// sent" is preserved per-channel; dispatch concurrency is a server
    /// implementation freedom the spec leaves unconstrained).
    pub async fn run(mut self) -> Result<()> {
        let handle = self.await_handle().await?;
        let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));

        loop {
            tokio::select! {
                frame = self.duplex.recv() => {
                    match frame {
                        Some(bytes) => {
                            if self.trace {
                                trace!(len = bytes.len(), "rpc server: frame received");
                            }
                            self.handle_inbound(bytes, &handle, &inflight).await
                        }
                        None => {
                            debug!("rpc server: duplex closed");
                            break;
                        }
                    }
                }
                event = self.duplex.next_event() => {
                    match event {
                        Some(LifecycleEvent::Destroy(reason)) => {
                            debug!(?reason, "rpc server: channel destroyed");
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        Self::teardown_inflight(&inflight);
        Ok(())
    }

    /// A listen-side duplex has no channel handle until pairing completes
    /// (`RemoteOpen`) — wait for that lifecycle event before resolving one,
    /// rather than assuming the handle already exists (§4.2 "listen" mode).
    async fn await_handle(&mut self) -> Result<Arc<ChannelHandle>> {
        loop {
            if let Ok(handle) = self.duplex.channel_handle().await {
                return Ok(handle);
            }
            match self.duplex.next_event().await {
                Some(LifecycleEvent::RemoteOpen(_)) => continue,
                Some(LifecycleEvent::Destroy(_)) | None => {
                    return Err(crate::error::PlexError::ChannelDestroyed);
                }
                _ => continue,
            }
        }
    }

    fn teardown_inflight(inflight: &InflightMap) {
        let mut guard = inflight.lock().unwrap();
        for (_, token) in guard.drain() {
            token.cancel();
        }
    }

    async fn handle_inbound(&self, bytes: Bytes, handle: &Arc<ChannelHandle>, inflight: &InflightMap) {
        let frame = match Frame::decode(bytes) {
            Ok(f) => f,
            Err(_) => {
                warn!("rpc server: undecodable frame, dropping");
                return;
            }
        };

        match frame {
            Frame::Cancel { rid, .. } => {
                if let Some(token) = inflight.lock().unwrap().remove(&rid) {
                    trace!(rid, "rpc server: cancel received");
                    token.cancel();
                }
            }
            Frame::Response { .. } => {
                warn!("rpc server: received a response frame, ignoring");
            }
            Frame::Request { rid, method, payload } => {
                self.handle_request(rid, method, payload, handle, inflight).await;
            }
        }
    }

    async fn handle_request(&self, rid: u32, method: MethodId, payload: Bytes, handle: &Arc<ChannelHandle>, inflight: &InflightMap) {
        if self.limits.max_server_routes != 0 && inflight.lock().unwrap().len() >= self.limits.max_server_routes {
            warn!(rid, limit = self.limits.max_server_routes, "rpc server: in-flight limit reached — resetting transport");
            let env = Envelope::err(ErrorCode::NotReady, "Too many in-flight requests");
            handle.send(Frame::Response { rid, method, more: false, payload: env.encode() }.encode());
            handle.destroy(None).await;
            return;
        }

        if payload.len() > self.limits.max_request_bytes {
            warn!(rid, len = payload.len(), max = self.limits.max_request_bytes, "rpc server: oversized payload rejected");
            let env = Envelope::err(
                ErrorCode::PayloadTooLarge,
                format!("payload of {} bytes exceeds max of {} bytes", payload.len(), self.limits.max_request_bytes),
            );
            handle.send(Frame::Response { rid, method, more: false, payload: env.encode() }.encode());
            return;
        }

        let req = match RequestPayload::decode(method, payload) {
            Ok(r) => r,
            Err(_) => {
                debug!(rid, "rpc server: bad request payload");
                let env = Envelope::err(ErrorCode::Unknown, "Bad request payload");
                handle.send(Frame::Response { rid, method, more: false, payload: env.encode() }.encode());
                return;
            }
        };

        let token = CancellationToken::new();
        inflight.lock().unwrap().insert(rid, token.clone());

        let handler = self.handler.clone();
        let handle = handle.clone();
        let inflight = inflight.clone();
        tokio::spawn(async move {
            Self::dispatch(rid, method, req, handler, handle, inflight, token).await;
        });
    }

    async fn dispatch(
        rid: u32,
        method: MethodId,
        req: RequestPayload,
        handler: Arc<dyn Handler>,
        handle: Arc<ChannelHandle>,
        inflight: InflightMap,
        token: CancellationToken,
    ) {
        match (method, req) {
            (MethodId::Scan, RequestPayload::Scan(req)) => {
                Self::dispatch_scan(rid, method, req, handler, handle, &inflight, token).await;
            }
            (m, req) => {
                let env = match (m, req) {
                    (MethodId::Get, RequestPayload::Get(r)) => handler.get(r).await,
                    (MethodId::Put, RequestPayload::Put(r)) => handler.put(r).await,
                    (MethodId::Del, RequestPayload::Del(r)) => handler.del(r).await,
                    (MethodId::Append, RequestPayload::Append(r)) => handler.append(r).await,
                    _ => unreachable!("request payload is decoded against its own method id"),
                };
                if token.is_cancelled() {
                    trace!(rid, "rpc server: call cancelled before reply");
                } else {
                    let env = env.unwrap_or_else(|| Envelope::err(ErrorCode::Unknown, format!("Unknown method: {}", m.name())));
                    handle.send(Frame::Response { rid, method: m, more: false, payload: env.encode() }.encode());
                }
                inflight.lock().unwrap().remove(&rid);
            }
        }
    }

    async fn dispatch_scan(
        rid: u32,
        method: MethodId,
        req: ScanRequest,
        handler: Arc<dyn Handler>,
        handle: Arc<ChannelHandle>,
        inflight: &InflightMap,
        token: CancellationToken,
    ) {
        use futures::StreamExt;

        let stream = handler.scan(req).await;
        let Some(mut stream) = stream else {
            if !token.is_cancelled() {
                let env = Envelope::err(ErrorCode::Unknown, "Scan not supported");
                handle.send(Frame::Response { rid, method, more: false, payload: env.encode() }.encode());
            }
            inflight.lock().unwrap().remove(&rid);
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(rid, "rpc server: scan cancelled, dropping producer");
                    break;
                }
                item = stream.next() => {
                    match item {
                        Some(env) => {
                            handle.send(Frame::Response { rid, method, more: true, payload: env.encode() }.encode());
                        }
                        None => {
                            if !token.is_cancelled() {
                                handle.send(Frame::Response { rid, method, more: false, payload: Bytes::new() }.encode());
                            }
                            break;
                        }
                    }
                }
            }
        }
        inflight.lock().unwrap().remove(&rid);
    }
}
