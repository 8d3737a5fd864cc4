//! Plex — a transport-agnostic toolkit for multiplexing lane-labeled duplex
//! byte streams over one connection, plus a request/reply RPC layer with
//! unary and server-streaming semantics built on top (see `SPEC_FULL.md`).
//!
//! Leaves-first, matching the system overview: [`transport`] adapters wrap
//! a caller's byte stream; [`substrate`] multiplexes it into named
//! sub-channels; [`channel`] and [`duplex`] present one sub-channel as a
//! stream-style duplex; [`peer`] owns a transport plus its substrate and
//! opens lanes on demand; [`rpc`] carries unary/streaming calls over a
//! lane; [`pool`] balances calls across many peers; [`service`] binds a
//! handler or client proxy to a peer's listen/connect side.

pub mod channel;
pub mod config;
pub mod duplex;
pub mod error;
pub mod logging;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod service;
pub mod substrate;
pub mod transport;

pub use channel::{ChannelConfig, ChannelId, ChannelKey, Protocol};
pub use config::{RpcLimits, DEFAULT_PROTOCOL};
pub use duplex::{DuplexDisposer, LifecycleEvent, PlexDuplex};
pub use error::{ErrorCode, PlexError, Result};
pub use peer::{Peer, LANE_EVENTS, LANE_RPC};
pub use pool::{CallKind, Locality, PeerMeta, PeerPool, PeerStats, Policy, PoolCallOpts, PoolEvent};
pub use rpc::{CallOpts, Envelope, Handler, MethodId, RequestPayload, RpcClient, RpcServer, ScanIter, ScanStream};
pub use service::{connect_store_port, expose_store_port, with_caps, CapsClient, ServeHandle, StorePortOpts};
pub use substrate::Substrate;
