//! In-memory loopback transport — used by the end-to-end scenarios in §8
//! ("over an in-memory duplex pair") and by this crate's own tests.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::PlexTransport;

const DEFAULT_BUF: usize = 64 * 1024;

pin_project! {
    pub struct MemTransport {
        #[pin]
        inner: Compat<tokio::io::DuplexStream>,
        id: usize,
    }
}

impl MemTransport {
    /// Build a connected pair — one end for each side of the conversation.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (a, b) = tokio::io::duplex(DEFAULT_BUF);
        let base = &a as *const _ as usize;
        (
            MemTransport { inner: a.compat(), id: base },
            MemTransport { inner: b.compat(), id: base.wrapping_add(1) },
        )
    }
}

impl PlexTransport for MemTransport {
    fn identity(&self) -> usize {
        self.id
    }
}

impl futures::AsyncRead for MemTransport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl futures::AsyncWrite for MemTransport {
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
