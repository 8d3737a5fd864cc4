//! Shared scaffolding for integration tests: a small key/value [`Handler`]
//! generalized just enough for the end-to-end scenarios in `SPEC_FULL.md`
//! §8 (a fixed per-instance label so pool tests can tell which peer
//! answered, an optional artificial delay on `get`/`scan` so timeout/abort/
//! cancel scenarios are deterministic), plus a helper for wiring one
//! connect-side [`Peer`] to one listen-side [`RpcServer`] over the
//! in-memory transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use plex::rpc::{AppendRequest, DelRequest, Envelope, GetRequest, Handler, PutRequest, RpcServer, ScanRequest, ScanStream};
use plex::{ChannelId, Peer, RpcLimits};

/// Channel id shared by both ends of every test pair.
pub const TEST_ID: &[u8] = b"test-channel";

#[derive(Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// When set, `get` ignores the store and always answers with this
    /// label — lets pool tests identify which peer served a call.
    label: Option<Bytes>,
    get_delay: Option<Duration>,
    scan_delay: Option<Duration>,
    pub puts_seen: AtomicUsize,
}

impl KvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn labeled(label: &str) -> Arc<Self> {
        Arc::new(Self { label: Some(Bytes::copy_from_slice(label.as_bytes())), ..Self::default() })
    }

    pub fn with_get_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { get_delay: Some(delay), ..Self::default() })
    }

    pub fn with_scan_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { scan_delay: Some(delay), ..Self::default() })
    }

    pub fn seed(&self, key: &str, value: &str) {
        self.data.lock().unwrap().insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }
}

#[async_trait]
impl Handler for KvStore {
    async fn get(&self, req: GetRequest) -> Option<Envelope> {
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(label) = &self.label {
            return Some(Envelope::ok_value(label.clone()));
        }
        let data = self.data.lock().unwrap();
        Some(match data.get(req.key.as_ref()) {
            Some(v) => Envelope::ok_value(Bytes::copy_from_slice(v)),
            None => Envelope::ok(),
        })
    }

    async fn put(&self, req: PutRequest) -> Option<Envelope> {
        self.puts_seen.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        data.insert(req.key.to_vec(), req.value.to_vec());
        Some(Envelope::ok())
    }

    async fn del(&self, req: DelRequest) -> Option<Envelope> {
        let mut data = self.data.lock().unwrap();
        data.remove(req.key.as_ref());
        Some(Envelope::ok())
    }

    async fn append(&self, req: AppendRequest) -> Option<Envelope> {
        let mut data = self.data.lock().unwrap();
        let key = format!("append/{}", data.len()).into_bytes();
        data.insert(key, req.value.to_vec());
        Some(Envelope::ok())
    }

    async fn scan(&self, req: ScanRequest) -> Option<ScanStream> {
        let rows: Vec<Bytes> = {
            let data = self.data.lock().unwrap();
            let mut rows: Vec<(Vec<u8>, Vec<u8>)> = data
                .iter()
                .filter(|(k, _)| match &req.prefix {
                    Some(p) => k.starts_with(p.as_ref()),
                    None => true,
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if req.reverse {
                rows.reverse();
            }
            rows.into_iter().map(|(_, v)| Bytes::from(v)).collect()
        };
        let delay = self.scan_delay;
        Some(Box::pin(futures::stream::unfold(rows.into_iter(), move |mut it| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = it.next()?;
            Some((Envelope::ok_value(next), it))
        })))
    }
}

/// Wire one connect-side [`Peer`] to one listen-side `RpcServer` over an
/// in-memory transport pair, both using [`TEST_ID`]. Returns the
/// connect-side peer (ready for `connect_rpc`) and the server's task handle.
pub fn spawn_listener(handler: Arc<dyn Handler>) -> (Arc<Peer>, tokio::task::JoinHandle<()>) {
    spawn_listener_with_limits(handler, RpcLimits::from_env())
}

pub fn spawn_listener_with_limits(handler: Arc<dyn Handler>, limits: RpcLimits) -> (Arc<Peer>, tokio::task::JoinHandle<()>) {
    let (client_transport, server_transport) = plex::transport::mem::MemTransport::pair();
    let server_peer = Peer::listen(server_transport);
    let client_peer = Arc::new(Peer::connect(client_transport));

    let duplex = server_peer.listen_rpc(ChannelId::from(TEST_ID.to_vec()));
    let server = RpcServer::with_limits(duplex, handler, limits);
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    (client_peer, task)
}
