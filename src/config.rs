use clap::{value_parser, Args, Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::DEFAULT_MAX_FLOWS;
use crate::copy::{CopyMode, IoTimeouts};
use crate::resolver::{FakeBinding, FakeIpRange, DEFAULT_FAKE_IP_RANGE};
use crate::socks::{Auth, ProxyAddr};

/// Copy strategy for relay directions
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CopyModeArg {
    /// Straight copy, ends on EOF or the first error
    Plain,
    /// Copy with per-operation read and write deadlines
    Deadline,
}

/// SOCKS5 authentication credentials
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// Upstream SOCKS5 username
    #[arg(short = 'u', long, requires = "password")]
    pub username: Option<String>,

    /// Upstream SOCKS5 password
    #[arg(short = 'P', long, requires = "username")]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Relay intercepted TCP flows through an upstream SOCKS5 proxy",
    long_about = "tcp2socks accepts TCP connections on a local listener and relays each one to its \
destination through an upstream SOCKS5 proxy.\n\nFeatures:\n- Fixed target or the original \
destination of redirected sockets (Linux SO_ORIGINAL_DST)\n- Fake-IP to hostname translation\n\
- Plain or deadline-aware copy\n- Per-flow sessions with process attribution and periodic stats\n"
)]
pub struct Cli {
    /// Local address to accept intercepted connections on
    #[arg(long, default_value = "127.0.0.1:12345", value_name = "HOST:PORT")]
    pub listen: SocketAddr,

    /// Upstream SOCKS5 proxy host (IP or hostname)
    #[arg(long, default_value = "127.0.0.1")]
    pub proxy_host: String,

    /// Upstream SOCKS5 proxy port
    #[arg(long, default_value_t = 1080)]
    pub proxy_port: u16,

    /// SOCKS5 authentication credentials for upstream server
    #[command(flatten)]
    pub auth: Option<Auths>,

    /// Fixed destination for every flow; defaults to the original destination
    #[arg(long, value_name = "HOST:PORT")]
    pub target: Option<SocketAddr>,

    /// Fake-DNS bindings in the form IP=HOST (comma separated or repeated)
    #[arg(long = "fake-host", value_delimiter = ',', value_name = "IP=HOST")]
    pub fake_hosts: Vec<FakeBinding>,

    /// Synthetic address pool handed out by fake DNS
    #[arg(long, default_value = DEFAULT_FAKE_IP_RANGE, value_name = "CIDR")]
    pub fake_ip_range: FakeIpRange,

    /// Copy strategy for relayed bytes
    #[arg(long, value_enum, default_value_t = CopyModeArg::Plain)]
    pub copy_mode: CopyModeArg,

    /// Read/write deadline in seconds for deadline copy mode
    #[arg(long, default_value_t = 30)]
    pub io_timeout: u64,

    /// TCP keepalive period in seconds for both ends of a flow
    #[arg(long, default_value_t = 30)]
    pub keepalive: u64,

    /// Track sessions with byte counters and process names: 1 or 0
    #[arg(long, value_parser = value_parser!(u8).range(0..=1), default_value_t = 1)]
    pub stats: u8,

    /// Interval seconds between session summary logs
    #[arg(long = "stats-interval", default_value_t = 60)]
    pub stats_interval: u64,

    /// Maximum concurrently relayed flows
    #[arg(long = "max-flows", default_value_t = DEFAULT_MAX_FLOWS)]
    pub max_flows: usize,
}

/// Tunnel configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub listen_addr: SocketAddr,
    pub proxy: ProxyAddr,
    pub socks_auth: Option<Auth>,
    pub target: Option<SocketAddr>,
    pub fake_hosts: Vec<FakeBinding>,
    pub fake_ip_range: FakeIpRange,
    pub copy_mode: CopyMode,
    pub keepalive: Duration,
    pub stats: bool,
    pub stats_interval: Duration,
    pub max_flows: usize,
}

impl TunnelConfig {
    /// Create TunnelConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let proxy = ProxyAddr::new(&args.proxy_host, args.proxy_port)?;

        let socks_auth = args
            .auth
            .as_ref()
            .and_then(|a| match (&a.username, &a.password) {
                (Some(u), Some(p)) => Some(Auth::new(u.clone(), p.clone())),
                _ => None,
            });

        if args.io_timeout == 0 {
            return Err(color_eyre::eyre::eyre!("--io-timeout must be at least 1 second"));
        }
        if args.keepalive == 0 {
            return Err(color_eyre::eyre::eyre!("--keepalive must be at least 1 second"));
        }
        if args.stats_interval == 0 {
            return Err(color_eyre::eyre::eyre!("--stats-interval must be at least 1 second"));
        }
        if args.max_flows == 0 {
            return Err(color_eyre::eyre::eyre!("--max-flows must be at least 1"));
        }
        if args.target == Some(args.listen) {
            return Err(color_eyre::eyre::eyre!(
                "--target {} would loop back into the listener",
                args.listen
            ));
        }

        let copy_mode = match args.copy_mode {
            CopyModeArg::Plain => CopyMode::Plain,
            CopyModeArg::Deadline => {
                CopyMode::Deadline(IoTimeouts::uniform(Duration::from_secs(args.io_timeout)))
            }
        };

        Ok(Self {
            listen_addr: args.listen,
            proxy,
            socks_auth,
            target: args.target,
            fake_hosts: args.fake_hosts,
            fake_ip_range: args.fake_ip_range,
            copy_mode,
            keepalive: Duration::from_secs(args.keepalive),
            stats: args.stats == 1,
            stats_interval: Duration::from_secs(args.stats_interval),
            max_flows: args.max_flows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> color_eyre::Result<TunnelConfig> {
        let cli = Cli::try_parse_from(std::iter::once("tcp2socks").chain(args.iter().copied()))?;
        TunnelConfig::from_cli(cli)
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:12345".parse::<SocketAddr>().unwrap());
        assert_eq!(config.proxy.to_string(), "127.0.0.1:1080");
        assert!(config.socks_auth.is_none());
        assert!(config.target.is_none());
        assert!(config.fake_hosts.is_empty());
        assert_eq!(config.fake_ip_range.to_string(), DEFAULT_FAKE_IP_RANGE);
        assert_eq!(config.copy_mode, CopyMode::Plain);
        assert_eq!(config.keepalive, Duration::from_secs(30));
        assert!(config.stats);
        assert_eq!(config.max_flows, DEFAULT_MAX_FLOWS);
    }

    #[test]
    fn deadline_mode_uses_io_timeout() {
        let config = parse(&["--copy-mode", "deadline", "--io-timeout", "5"]).unwrap();
        assert_eq!(
            config.copy_mode,
            CopyMode::Deadline(IoTimeouts::uniform(Duration::from_secs(5)))
        );
    }

    #[test]
    fn fake_hosts_accept_commas_and_repeats() {
        let config = parse(&[
            "--fake-host",
            "198.18.0.1=a.example,198.18.0.2=b.example.",
            "--fake-host",
            "198.18.0.3=C.Example",
        ])
        .unwrap();
        let hosts: Vec<_> = config.fake_hosts.iter().map(|b| b.host.as_str()).collect();
        assert_eq!(hosts, ["a.example", "b.example", "c.example"]);
    }

    #[test]
    fn credentials_require_both_parts() {
        assert!(parse(&["-u", "alice"]).is_err());
        let config = parse(&["-u", "alice", "-P", "secret"]).unwrap();
        assert_eq!(config.socks_auth.unwrap().username, "alice");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse(&["--proxy-port", "0"]).is_err());
        assert!(parse(&["--proxy-host", "not a host"]).is_err());
        assert!(parse(&["--stats", "2"]).is_err());
        assert!(parse(&["--max-flows", "0"]).is_err());
        assert!(parse(&["--fake-ip-range", "198.18.0.0/31"]).is_err());
        assert!(parse(&["--target", "127.0.0.1:12345"]).is_err());
    }
}
