use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::handler::{HandleError, TcpHandler};
use crate::socks::ProxyDialer;
use crate::target::Target;

/// Where the destination of an accepted connection comes from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetSource {
    /// Every flow goes to the same destination
    Fixed(SocketAddr),
    /// The pre-redirect destination recorded by the kernel
    OriginalDst,
}

impl TargetSource {
    /// Destination for `stream`, accepted on `listen_addr`
    pub fn resolve(&self, stream: &TcpStream, listen_addr: SocketAddr) -> io::Result<Target> {
        match self {
            TargetSource::Fixed(addr) => Ok(Target::tcp(*addr)),
            TargetSource::OriginalDst => {
                let addr = original_dst(stream)?;
                if addr == listen_addr {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("connection to {} was not redirected", addr),
                    ));
                }
                Ok(Target::tcp(addr))
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    let sock = socket2::SockRef::from(stream);
    let addr = match stream.local_addr()? {
        SocketAddr::V4(_) => sock.original_dst()?,
        SocketAddr::V6(_) => sock.original_dst_ipv6()?,
    };
    addr.as_socket().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination is not an IP address",
        )
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "original destination lookup is only available on Linux",
    ))
}

/// Close `stream` with a reset instead of an orderly shutdown
fn abort(stream: TcpStream) {
    if let Err(e) = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!("Failed to arm reset on close: {}", e);
    }
}

/// Accept loop feeding intercepted connections to a [`TcpHandler`]
pub struct Server<D> {
    listener: TcpListener,
    handler: Arc<TcpHandler<D>>,
    targets: TargetSource,
}

impl<D: ProxyDialer> Server<D> {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<TcpHandler<D>>,
        targets: TargetSource,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            targets,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Relays already running are left to the handler's supervisor.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        let listen_addr = self.listener.local_addr()?;
        info!("Accepting connections on {}", listen_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            };

            let target = match self.targets.resolve(&stream, listen_addr) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Dropping connection from {}: {}", peer_addr, e);
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                debug!("Connection from {} to {}", peer_addr, target);
                if let Err(HandleError { error, local }) = handler.handle(stream, target).await {
                    match error {
                        TunnelError::Overloaded(active) => {
                            warn!("Refusing {} -> {}: {} flows active", peer_addr, target, active)
                        }
                        e => warn!("Connection from {} to {} failed: {}", peer_addr, target, e),
                    }
                    abort(local);
                }
            });
        }

        info!("Stopped accepting connections on {}", listen_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionTable;
    use crate::socks::tests::spawn_echo_socks5;
    use crate::socks::Socks5Dialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serve_relays_to_fixed_target() {
        let (proxy_addr, socks) = spawn_echo_socks5().await;
        let sessions = Arc::new(SessionTable::new());
        let handler = Arc::new(
            TcpHandler::new(
                proxy_addr.ip().to_string(),
                proxy_addr.port(),
                Socks5Dialer::new(None),
            )
            .with_sessions(sessions.clone()),
        );

        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&handler),
            TargetSource::Fixed("203.0.113.7:8080".parse().unwrap()),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(sessions.len(), 1);

        drop(client);
        shutdown.cancel();
        serving.await.unwrap().unwrap();
        assert!(handler.supervisor().drain(Duration::from_secs(5)).await);
        assert!(sessions.is_empty());
        assert_eq!(socks.await.unwrap(), "203.0.113.7:8080");
    }

    #[tokio::test]
    async fn test_failed_dial_resets_client() {
        // Nothing listens on the proxy port
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = closed.local_addr().unwrap().port();
        drop(closed);

        let handler = Arc::new(TcpHandler::new(
            "127.0.0.1",
            proxy_port,
            Socks5Dialer::new(None),
        ));
        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            handler,
            TargetSource::Fixed("203.0.113.7:8080".parse().unwrap()),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let res = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("client should be disconnected after the dial fails");
        match res {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            Ok(n) => panic!("expected a reset, read {} bytes", n),
        }

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let handler = Arc::new(TcpHandler::new("127.0.0.1", 1080, Socks5Dialer::new(None)));
        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            handler,
            TargetSource::OriginalDst,
        )
        .await
        .unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), server.serve(shutdown))
            .await
            .expect("serve should return once cancelled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_original_dst_without_redirect_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(listen_addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        assert!(TargetSource::OriginalDst.resolve(&stream, listen_addr).is_err());
    }

    #[tokio::test]
    async fn test_fixed_target_ignores_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(listen_addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let fixed: SocketAddr = "192.0.2.1:443".parse().unwrap();
        let target = TargetSource::Fixed(fixed).resolve(&stream, listen_addr).unwrap();
        assert_eq!(target, Target::tcp(fixed));
    }
}
