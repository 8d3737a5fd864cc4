//! TCP transport adapter.
//!
//! `yamux` does its own internal length-prefixed framing, so a raw
//! [`tokio::net::TcpStream`] is already everything the substrate needs —
//! no separate length-prefix framer has to sit in between (that framer is
//! yamux itself, the "existing library primitive" spec.md assumes).

use pin_project_lite::pin_project;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::PlexTransport;

pin_project! {
    pub struct TcpTransport {
        #[pin]
        inner: Compat<TcpStream>,
        id: usize,
    }
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let id = stream.as_raw_fd() as usize;
        Self { inner: stream.compat(), id }
    }

    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl PlexTransport for TcpTransport {
    fn identity(&self) -> usize {
        self.id
    }
}

impl futures::AsyncRead for TcpTransport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl futures::AsyncWrite for TcpTransport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}
