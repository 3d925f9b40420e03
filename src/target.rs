use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport protocol of an intercepted flow
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of an intercepted flow as seen by the interface stack
///
/// The IP may be a synthetic address handed out by fake DNS.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Target {
    pub network: Network,
    pub addr: SocketAddr,
}

impl Target {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            addr,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.internal", 443), "example.internal:443");
        assert_eq!(join_host_port("203.0.113.5", 80), "203.0.113.5:80");
        assert_eq!(join_host_port("2001:db8::1", 8080), "[2001:db8::1]:8080");
        assert_eq!(join_host_port("[::1]", 22), "[::1]:22");
    }

    #[test]
    fn test_target_display() {
        let target = Target::tcp("10.0.0.1:443".parse().unwrap());
        assert_eq!(target.to_string(), "tcp://10.0.0.1:443");
        assert_eq!(target.port(), 443);
    }
}
