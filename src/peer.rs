//! A peer: one transport plus the multiplex substrate over it (§3, §4.3).

use std::sync::Arc;
use yamux::Mode;

use crate::channel::{ChannelConfig, ChannelId, Protocol};
use crate::config::DEFAULT_PROTOCOL;
use crate::duplex::PlexDuplex;
use crate::error::Result;
use crate::substrate::Substrate;
use crate::transport::PlexTransport;

/// RPC and event lane suffixes (§3, §6).
pub const LANE_RPC: &str = "rpc";
pub const LANE_EVENTS: &str = "events";

/// Owns exactly one transport and exactly one multiplex substrate over it.
pub struct Peer {
    substrate: Arc<Substrate>,
    protocol_base: String,
}

impl Peer {
    /// Wrap a transport as the *initiating* side of the yamux connection
    /// (`Mode::Client`). Substrates are cached by transport identity so
    /// repeated `Peer`s over the same transport share one connection.
    pub fn connect(transport: impl PlexTransport + 'static) -> Self {
        Self::with_protocol(transport, DEFAULT_PROTOCOL, Mode::Client)
    }

    /// Wrap a transport as the *accepting* side (`Mode::Server`).
    pub fn listen(transport: impl PlexTransport + 'static) -> Self {
        Self::with_protocol(transport, DEFAULT_PROTOCOL, Mode::Server)
    }

    fn with_protocol(transport: impl PlexTransport + 'static, protocol_base: &str, mode: Mode) -> Self {
        let identity = transport.identity();
        let substrate = Substrate::for_transport(identity, transport, mode);
        Self {
            substrate,
            protocol_base: protocol_base.to_string(),
        }
    }

    fn cfg(&self, id: impl Into<ChannelId>, lane: &str) -> ChannelConfig {
        ChannelConfig::new(self.substrate.clone(), id.into(), Protocol::with_lane(&self.protocol_base, lane))
    }

    pub async fn connect_rpc(&self, id: impl Into<ChannelId>) -> Result<PlexDuplex> {
        PlexDuplex::connect(self.cfg(id, LANE_RPC)).await
    }

    pub fn listen_rpc(&self, id: impl Into<ChannelId>) -> PlexDuplex {
        PlexDuplex::listen(self.cfg(id, LANE_RPC))
    }

    pub async fn connect_stream(&self, id: impl Into<ChannelId>) -> Result<PlexDuplex> {
        PlexDuplex::connect(self.cfg(id, LANE_EVENTS)).await
    }

    pub fn listen_stream(&self, id: impl Into<ChannelId>) -> PlexDuplex {
        PlexDuplex::listen(self.cfg(id, LANE_EVENTS))
    }

    pub async fn connect_lane(&self, id: impl Into<ChannelId>, lane: &str) -> Result<PlexDuplex> {
        PlexDuplex::connect(self.cfg(id, lane)).await
    }

    pub fn listen_lane(&self, id: impl Into<ChannelId>, lane: &str) -> PlexDuplex {
        PlexDuplex::listen(self.cfg(id, lane))
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    pub fn protocol_base(&self) -> &str {
        &self.protocol_base
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::new(bytes::Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for ChannelId {
    fn from(v: Vec<u8>) -> Self {
        ChannelId::new(bytes::Bytes::from(v))
    }
}
