use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

/// A full-duplex byte stream that can take part in a flow
///
/// Keepalive and addressing are optional capabilities: streams without an
/// underlying socket keep the defaults, which report "unsupported".
pub trait FlowStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Enable TCP keepalive with the given period
    ///
    /// Returns `Ok(false)` when the stream has no socket to configure.
    fn set_keepalive(&self, _period: Duration) -> io::Result<bool> {
        Ok(false)
    }

    /// Address of the far end of this stream
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn tcp_keepalive(stream: &TcpStream, period: Duration) -> io::Result<bool> {
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(period);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(true)
}

impl FlowStream for TcpStream {
    fn set_keepalive(&self, period: Duration) -> io::Result<bool> {
        tcp_keepalive(self, period)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl FlowStream for Socks5Stream<TcpStream> {
    fn set_keepalive(&self, period: Duration) -> io::Result<bool> {
        tcp_keepalive(self, period)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl FlowStream for DuplexStream {}

impl FlowStream for Box<dyn FlowStream> {
    fn set_keepalive(&self, period: Duration) -> io::Result<bool> {
        (**self).set_keepalive(period)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_stream_supports_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        assert!(client.set_keepalive(Duration::from_secs(30)).unwrap());
        assert!(SockRef::from(&client).keepalive().unwrap());
        assert_eq!(FlowStream::peer_addr(&server), Some(peer));
    }

    #[tokio::test]
    async fn test_duplex_stream_skips_keepalive() {
        let (a, _b) = tokio::io::duplex(64);
        assert!(!a.set_keepalive(Duration::from_secs(30)).unwrap());
        assert!(FlowStream::peer_addr(&a).is_none());
    }
}
