//! WebSocket transport adapter (§6).
//!
//! `yamux` wants an ordered byte stream; a WebSocket connection gives us
//! discrete binary messages instead. This adapter folds the two together:
//! writes are batched into one binary message per `poll_close`-free write
//! burst is overkill, so instead every `poll_write` call is sent as its own
//! binary frame, and reads drain a small byte buffer filled by whichever
//! incoming message is currently being consumed.

use bytes::{Buf, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::PlexTransport;

pin_project! {
    pub struct WsTransport {
        #[pin]
        inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
        read_buf: BytesMut,
        id: usize,
    }
}

impl WsTransport {
    pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>, id: usize) -> Self {
        Self { inner, read_buf: BytesMut::new(), id }
    }

    /// Connect as a client to a `ws://` or `wss://` URL.
    pub async fn connect(url: &str) -> crate::error::Result<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| crate::error::PlexError::Substrate(e.to_string()))?;
        let id = url.as_ptr() as usize;
        Ok(Self::new(stream, id))
    }

    /// Accept a server-side connection over an already-established TCP stream.
    pub async fn accept(raw: TcpStream) -> crate::error::Result<Self> {
        let id = {
            use std::os::fd::AsRawFd;
            raw.as_raw_fd() as usize
        };
        let stream = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(raw))
            .await
            .map_err(|e| crate::error::PlexError::Substrate(e.to_string()))?;
        Ok(Self::new(stream, id))
    }
}

impl PlexTransport for WsTransport {
    fn identity(&self) -> usize {
        self.id
    }
}

impl futures::AsyncRead for WsTransport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        let mut this = self.project();
        loop {
            if !this.read_buf.is_empty() {
                let n = std::cmp::min(buf.len(), this.read_buf.len());
                buf[..n].copy_from_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(n));
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.read_buf.extend_from_slice(&data);
                    continue;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(0));
                }
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl futures::AsyncWrite for WsTransport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut this = self.project();
        match this.inner.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
            Poll::Pending => return Poll::Pending,
        }
        match this.inner.as_mut().start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project()
            .inner
            .poll_flush(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project()
            .inner
            .poll_close(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
