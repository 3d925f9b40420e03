use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::Session;
use crate::stream::FlowStream;

/// Per-session traffic counters (bytes)
///
/// Both relay directions update these concurrently, so they are atomics.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl TrafficCounters {
    pub fn add_rx(&self, n: u64) { self.rx_bytes.fetch_add(n, Ordering::Relaxed); }
    pub fn add_tx(&self, n: u64) { self.tx_bytes.fetch_add(n, Ordering::Relaxed); }
    pub fn rx(&self) -> u64 { self.rx_bytes.load(Ordering::Relaxed) }
    pub fn tx(&self) -> u64 { self.tx_bytes.load(Ordering::Relaxed) }
}

/// Stream decorator that counts bytes into a session
///
/// Wraps the remote side of a flow: bytes read from it are downloads, bytes
/// written to it are uploads.
pub struct SessionStream<S> {
    inner: S,
    session: Arc<Session>,
}

impl<S> SessionStream<S> {
    pub fn new(inner: S, session: Arc<Session>) -> Self {
        Self { inner, session }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SessionStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.session
                .add_download((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SessionStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.session.add_upload(n as u64);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: FlowStream> FlowStream for SessionStream<S> {
    fn set_keepalive(&self, period: Duration) -> io::Result<bool> {
        self.inner.set_keepalive(period)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}
