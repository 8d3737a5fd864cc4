//! `plex-cli` — a thin smoke-test harness for manually exercising a Plex
//! connection over TCP. Not part of the library's public surface: it only
//! exists so the toolkit is runnable out of the box (SPEC_FULL.md §1).
//!
//! Examples:
//!   plex-cli serve --addr 127.0.0.1:9700
//!   plex-cli put --addr 127.0.0.1:9700 --key hello --value world
//!   plex-cli get --addr 127.0.0.1:9700 --key hello
//!   plex-cli scan --addr 127.0.0.1:9700 --prefix h

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use plex::rpc::{
    AppendRequest, DelRequest, Envelope, GetRequest, Handler, PutRequest, RpcServer, ScanRequest, ScanStream,
};
use plex::{CallOpts, ChannelId, Peer, RpcClient, RpcLimits};

#[derive(Parser)]
#[command(name = "plex-cli", about = "Plex smoke-test harness", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PLEX_LOG", default_value = "info", global = true)]
    log: String,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    #[arg(long, env = "PLEX_LOG_FILE", global = true)]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single-connection server: accept one TCP connection, open a
    /// listen `rpc` lane, and serve an in-memory key/value store over it.
    ///
    /// Examples:
    ///   plex-cli serve --addr 127.0.0.1:9700
    Serve {
        #[arg(long, default_value = "127.0.0.1:9700")]
        addr: String,

        /// Channel id the client is expected to connect with.
        #[arg(long, default_value = "plex-cli")]
        id: String,
    },
    /// Connect and issue a single `get`.
    Get {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value = "plex-cli")]
        id: String,
        #[arg(long)]
        key: String,
        /// Per-call timeout in milliseconds (0 disables).
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },
    /// Connect and issue a single `put`.
    Put {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value = "plex-cli")]
        id: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },
    /// Connect and issue a single `del`.
    Del {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value = "plex-cli")]
        id: String,
        #[arg(long)]
        key: String,
    },
    /// Connect and issue a single `append`.
    Append {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value = "plex-cli")]
        id: String,
        #[arg(long)]
        value: String,
    },
    /// Connect and stream a `scan`, printing each row until the server ends
    /// the stream (or `--limit` rows have been printed, in which case the
    /// client cancels).
    Scan {
        #[arg(long)]
        addr: String,
        #[arg(long, default_value = "plex-cli")]
        id: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        reverse: bool,
        /// Stop and cancel after this many rows (0 = no limit).
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = plex::logging::init(&args.log, args.log_file.as_deref());

    match args.command {
        Command::Serve { addr, id } => run_serve(&addr, &id).await,
        Command::Get { addr, id, key, timeout_ms } => run_get(&addr, &id, &key, timeout_ms).await,
        Command::Put { addr, id, key, value, timeout_ms } => run_put(&addr, &id, &key, &value, timeout_ms).await,
        Command::Del { addr, id, key } => run_del(&addr, &id, &key).await,
        Command::Append { addr, id, value } => run_append(&addr, &id, &value).await,
        Command::Scan { addr, id, prefix, reverse, limit } => run_scan(&addr, &id, prefix, reverse, limit).await,
    }
}

async fn run_serve(addr: &str, id: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr, "plex-cli: listening for one connection");
    let (stream, peer_addr) = listener.accept().await.context("accepting connection")?;
    info!(%peer_addr, "plex-cli: accepted connection");

    let transport = plex::transport::tcp::TcpTransport::new(stream);
    let peer = Peer::listen(transport);
    let duplex = peer.listen_rpc(ChannelId::from(id.as_bytes().to_vec()));

    let handler = std::sync::Arc::new(KvStore::default());
    let server = RpcServer::with_limits(duplex, handler, RpcLimits::from_env());
    server.run().await?;
    info!("plex-cli: connection closed, exiting");
    Ok(())
}

async fn dial(addr: &str, id: &str) -> Result<RpcClient> {
    let stream = TcpStream::connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
    let transport = plex::transport::tcp::TcpTransport::new(stream);
    let peer = Peer::connect(transport);
    let duplex = peer.connect_rpc(ChannelId::from(id.as_bytes().to_vec())).await?;
    Ok(RpcClient::new(duplex).await?)
}

fn print_envelope(env: &Envelope) {
    match env {
        Envelope::Ok { value, meta_key } => {
            let value = value.as_deref().map(|v| String::from_utf8_lossy(v).into_owned());
            println!("ok value={value:?} meta_key={meta_key:?}");
        }
        Envelope::Err { code, message } => {
            println!("err code={code} message={message:?}");
        }
    }
}

fn call_opts(timeout_ms: u64) -> CallOpts {
    let mut opts = CallOpts::default();
    if timeout_ms > 0 {
        opts = opts.with_timeout(Duration::from_millis(timeout_ms));
    }
    opts
}

async fn run_get(addr: &str, id: &str, key: &str, timeout_ms: u64) -> Result<()> {
    let client = dial(addr, id).await?;
    let env = client
        .get(GetRequest { key: Bytes::copy_from_slice(key.as_bytes()), caps: None }, call_opts(timeout_ms))
        .await?;
    print_envelope(&env);
    client.close().await;
    Ok(())
}

async fn run_put(addr: &str, id: &str, key: &str, value: &str, timeout_ms: u64) -> Result<()> {
    let client = dial(addr, id).await?;
    let env = client
        .put(
            PutRequest { key: Bytes::copy_from_slice(key.as_bytes()), value: Bytes::copy_from_slice(value.as_bytes()), caps: None },
            call_opts(timeout_ms),
        )
        .await?;
    print_envelope(&env);
    client.close().await;
    Ok(())
}

async fn run_del(addr: &str, id: &str, key: &str) -> Result<()> {
    let client = dial(addr, id).await?;
    let env = client
        .del(DelRequest { key: Bytes::copy_from_slice(key.as_bytes()), caps: None }, CallOpts::default())
        .await?;
    print_envelope(&env);
    client.close().await;
    Ok(())
}

async fn run_append(addr: &str, id: &str, value: &str) -> Result<()> {
    let client = dial(addr, id).await?;
    let env = client
        .append(AppendRequest { value: Bytes::copy_from_slice(value.as_bytes()), caps: None }, CallOpts::default())
        .await?;
    print_envelope(&env);
    client.close().await;
    Ok(())
}

async fn run_scan(addr: &str, id: &str, prefix: Option<String>, reverse: bool, limit: usize) -> Result<()> {
    let client = dial(addr, id).await?;
    let req = ScanRequest {
        prefix: prefix.map(|p| Bytes::copy_from_slice(p.as_bytes())),
        reverse,
        range: Default::default(),
        caps: None,
    };
    let mut iter = client.scan(req, CallOpts::default()).await?;
    let mut count = 0usize;
    while let Some(item) = iter.next().await {
        match item {
            Ok(env) => print_envelope(&env),
            Err(e) => {
                warn!(err = %e, "plex-cli: scan error");
                break;
            }
        }
        count += 1;
        if limit != 0 && count >= limit {
            info!(limit, "plex-cli: row limit reached, cancelling scan");
            iter.cancel();
            break;
        }
    }
    client.close().await;
    Ok(())
}

/// A toy in-memory key/value [`Handler`] — just enough behavior to make
/// `serve`/`get`/`put`/`del`/`append`/`scan` observable end to end. Not a
/// production store; no persistence, no concurrency control beyond a
/// single mutex.
#[derive(Default)]
struct KvStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[async_trait]
impl Handler for KvStore {
    async fn get(&self, req: GetRequest) -> Option<Envelope> {
        let data = self.data.lock().unwrap();
        Some(match data.get(req.key.as_ref()) {
            Some(v) => Envelope::ok_value(Bytes::copy_from_slice(v)),
            None => Envelope::ok(),
        })
    }

    async fn put(&self, req: PutRequest) -> Option<Envelope> {
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
        // No natural key for a bare append in this toy store — log the
        // append under a synthetic sequence key so `scan` can observe it.
        let mut data = self.data.lock().unwrap();
        let key = format!("append/{}", data.len()).into_bytes();
        data.insert(key, req.value.to_vec());
        Some(Envelope::ok())
    }

    async fn scan(&self, req: ScanRequest) -> Option<ScanStream> {
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
        let envelopes: Vec<Envelope> = rows.into_iter().map(|(_, v)| Envelope::ok_value(Bytes::from(v))).collect();
        Some(Box::pin(tokio_stream::iter(envelopes)))
    }
}
