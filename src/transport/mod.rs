//! External transport adapters (§6).
//!
//! The core only requires an ordered, reliable byte stream — that's the
//! contract [`PlexTransport`] captures, and it's exactly what `yamux`
//! (the multiplex substrate, see [`crate::substrate`]) needs underneath it.
//! `identity()` is what lets [`crate::substrate::Substrate::for_transport`]
//! cache one substrate per transport even when several [`crate::peer::Peer`]s
//! are built over it.

pub mod mem;
pub mod tcp;
pub mod ws;

/// An ordered, reliable, bidirectional byte transport. Implementors need
/// only provide identity for the substrate cache — `AsyncRead`/`AsyncWrite`
/// is where the actual bytes flow.
pub trait PlexTransport: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static {
    /// A value unique to this transport instance, used to key the
    /// substrate cache (§5 "the multiplex substrate is cached once per
    /// transport"). Two calls with the same underlying transport must
    /// return the same identity.
    fn identity(&self) -> usize;
}
