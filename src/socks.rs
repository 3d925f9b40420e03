use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::stream::FlowStream;
use crate::target::{join_host_port, Network};

/// Default timeout for reaching the proxy and completing the handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 username/password credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validated address of the upstream proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddr {
    host: String,
    port: u16,
}

impl ProxyAddr {
    /// Build a proxy address from configured host and port
    ///
    /// The host may be an IP literal (IPv6 optionally bracketed) or a DNS
    /// name. Fails with [`TunnelError::Configuration`] otherwise.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let config_err = |reason: &str| TunnelError::Configuration {
            host: host.to_string(),
            port,
            reason: reason.to_string(),
        };

        let trimmed = host.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);

        if unbracketed.is_empty() {
            return Err(config_err("empty host"));
        }
        if port == 0 {
            return Err(config_err("port must be non-zero"));
        }
        if unbracketed.parse::<IpAddr>().is_err() && !is_valid_hostname(unbracketed) {
            return Err(config_err("not an IP address or hostname"));
        }

        Ok(Self {
            host: unbracketed.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

fn is_valid_hostname(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Opens streams to destinations through an upstream proxy
pub trait ProxyDialer: Send + Sync + 'static {
    type Stream: FlowStream;

    /// Connect to `target` (`host:port`) through the proxy at `proxy`
    fn dial(
        &self,
        proxy: &ProxyAddr,
        network: Network,
        target: &str,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// SOCKS5 dialer backed by `tokio-socks`
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    auth: Option<Auth>,
    connect_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(auth: Option<Auth>) -> Self {
        Self {
            auth,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(
        &self,
        proxy: &str,
        target: &str,
    ) -> std::result::Result<Socks5Stream<TcpStream>, tokio_socks::Error> {
        match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password(proxy, target, &auth.username, &auth.password)
                    .await
            }
            None => Socks5Stream::connect(proxy, target).await,
        }
    }
}

impl ProxyDialer for Socks5Dialer {
    type Stream = Socks5Stream<TcpStream>;

    async fn dial(
        &self,
        proxy: &ProxyAddr,
        network: Network,
        target: &str,
    ) -> Result<Self::Stream> {
        if network != Network::Tcp {
            return Err(TunnelError::Unsupported(network.to_string()));
        }

        let proxy_addr = proxy.to_string();
        let dial_err = |reason: String| TunnelError::Dial {
            proxy: proxy_addr.clone(),
            target: target.to_string(),
            reason,
        };

        debug!("Dialing {} via SOCKS5 proxy {}", target, proxy_addr);
        match tokio::time::timeout(self.connect_timeout, self.connect(&proxy_addr, target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(dial_err(e.to_string())),
            Err(_) => Err(dial_err(format!(
                "timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}
