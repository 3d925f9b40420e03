use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

/// Default synthetic address pool (RFC 2544 benchmarking range)
pub const DEFAULT_FAKE_IP_RANGE: &str = "198.18.0.0/15";

/// Reverse lookup from synthetic addresses to the hostnames they stand for
pub trait FakeDns: Send + Sync {
    /// Hostname previously bound to `ip`, if any
    fn ip_to_host(&self, ip: IpAddr) -> Option<String>;

    /// Whether `ip` belongs to the synthetic address pool
    fn is_fake_ip(&self, ip: IpAddr) -> bool;
}

/// Resolve the host to dial for a target IP
///
/// Returns the hostname bound to `ip` when `fake_dns` knows one, otherwise the
/// textual form of `ip`. A missing binding is not an error.
///
/// # Arguments
/// * `fake_dns` - Optional fake-DNS table
/// * `ip` - Destination IP of the intercepted flow
pub fn resolve_host(fake_dns: Option<&dyn FakeDns>, ip: IpAddr) -> String {
    if let Some(dns) = fake_dns {
        if let Some(host) = dns.ip_to_host(ip) {
            return host;
        }
        if dns.is_fake_ip(ip) {
            debug!("Synthetic address {} has no hostname binding", ip);
        }
    }
    ip.to_string()
}

/// An IPv4 CIDR block, e.g. `198.18.0.0/15`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeIpRange {
    network: u32,
    prefix: u8,
}

impl FakeIpRange {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 30 {
            return Err(format!("prefix /{} leaves no usable addresses", prefix));
        }
        let mask = Self::mask(prefix);
        Ok(Self {
            network: u32::from(base) & mask,
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => u32::from(v4) & Self::mask(self.prefix) == self.network,
            IpAddr::V6(_) => false,
        }
    }

    /// Number of host addresses, excluding network and broadcast
    pub fn capacity(&self) -> u32 {
        ((1u64 << (32 - u32::from(self.prefix))) - 2) as u32
    }

    /// The `n`th host address of the range (0-based, skips the network address)
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        if n >= self.capacity() {
            return None;
        }
        Some(Ipv4Addr::from(self.network + 1 + n))
    }
}

impl FromStr for FakeIpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("expected CIDR notation, got {}", s))?;
        let base: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("invalid IPv4 network address: {}", addr))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid prefix length: {}", prefix))?;
        Self::new(base, prefix)
    }
}

impl fmt::Display for FakeIpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix)
    }
}

/// A static `IP=HOST` binding given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeBinding {
    pub ip: IpAddr,
    pub host: String,
}

impl FromStr for FakeBinding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, host) = s
            .split_once('=')
            .ok_or_else(|| format!("expected IP=HOST, got {}", s))?;
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| format!("invalid IP address in binding: {}", ip))?;
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return Err(format!("empty hostname in binding for {}", ip));
        }
        Ok(Self { ip, host })
    }
}

#[derive(Debug, Default)]
struct Bindings {
    by_ip: HashMap<IpAddr, String>,
    by_host: HashMap<String, IpAddr>,
    cursor: u32,
}

/// In-memory fake-DNS table over a synthetic address pool
#[derive(Debug)]
pub struct FakeDnsTable {
    range: FakeIpRange,
    bindings: RwLock<Bindings>,
}

impl FakeDnsTable {
    pub fn new(range: FakeIpRange) -> Self {
        Self {
            range,
            bindings: RwLock::new(Bindings::default()),
        }
    }

    /// Bind `host` to `ip`, replacing any previous binding of either side
    pub fn insert(&self, ip: IpAddr, host: impl Into<String>) {
        let host = host.into();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old_host) = bindings.by_ip.insert(ip, host.clone()) {
            bindings.by_host.remove(&old_host);
        }
        if let Some(old_ip) = bindings.by_host.insert(host, ip) {
            if old_ip != ip {
                bindings.by_ip.remove(&old_ip);
            }
        }
    }

    /// Hand out a pool address for `host`
    ///
    /// Returns the existing address when `host` is already bound, otherwise
    /// the next free address after the last allocation. Returns `None` once
    /// the pool is exhausted.
    pub fn allocate(&self, host: &str) -> Option<Ipv4Addr> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(IpAddr::V4(ip)) = bindings.by_host.get(&host) {
            return Some(*ip);
        }

        let capacity = self.range.capacity();
        for step in 0..capacity {
            let n = ((u64::from(bindings.cursor) + u64::from(step)) % u64::from(capacity)) as u32;
            let ip = self.range.host(n)?;
            if bindings.by_ip.contains_key(&IpAddr::V4(ip)) {
                continue;
            }
            bindings.cursor = ((u64::from(n) + 1) % u64::from(capacity)) as u32;
            bindings.by_ip.insert(IpAddr::V4(ip), host.clone());
            bindings.by_host.insert(host, IpAddr::V4(ip));
            return Some(ip);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_ip
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FakeDns for FakeDnsTable {
    fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_ip
            .get(&ip)
            .cloned()
    }

    fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.range.contains(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FakeDnsTable {
        FakeDnsTable::new(DEFAULT_FAKE_IP_RANGE.parse().unwrap())
    }

    #[test]
    fn test_resolve_mapped_synthetic_ip() {
        let dns = table();
        let ip: IpAddr = "198.18.0.7".parse().unwrap();
        dns.insert(ip, "example.internal");

        assert_eq!(resolve_host(Some(&dns), ip), "example.internal");
    }

    #[test]
    fn test_resolve_unmapped_ip_falls_back_to_literal() {
        let dns = table();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert_eq!(resolve_host(Some(&dns), ip), "203.0.113.5");
        assert_eq!(resolve_host(None, ip), "203.0.113.5");
    }

    #[test]
    fn test_resolve_ipv6_literal() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(resolve_host(None, ip), "2001:db8::1");
    }

    #[test]
    fn test_fake_ip_range_contains() {
        let range: FakeIpRange = "198.18.0.0/15".parse().unwrap();
        assert!(range.contains("198.18.0.1".parse().unwrap()));
        assert!(range.contains("198.19.255.254".parse().unwrap()));
        assert!(!range.contains("198.20.0.1".parse().unwrap()));
        assert!(!range.contains("::1".parse().unwrap()));
        assert_eq!(range.to_string(), "198.18.0.0/15");
    }

    #[test]
    fn test_fake_ip_range_rejects_bad_input() {
        assert!("198.18.0.0".parse::<FakeIpRange>().is_err());
        assert!("198.18.0.0/31".parse::<FakeIpRange>().is_err());
        assert!("nonsense/15".parse::<FakeIpRange>().is_err());
    }

    #[test]
    fn test_allocate_is_stable_per_host() {
        let dns = FakeDnsTable::new("10.0.0.0/29".parse().unwrap());
        let a = dns.allocate("a.example").unwrap();
        let b = dns.allocate("b.example").unwrap();

        assert_ne!(a, b);
        assert_eq!(dns.allocate("A.example.").unwrap(), a);
        assert_eq!(dns.ip_to_host(IpAddr::V4(a)).as_deref(), Some("a.example"));
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_allocate_exhausts_pool() {
        // /30 has two usable host addresses
        let dns = FakeDnsTable::new("10.0.0.0/30".parse().unwrap());
        assert!(dns.allocate("one").is_some());
        assert!(dns.allocate("two").is_some());
        assert!(dns.allocate("three").is_none());
        assert_eq!(dns.len(), 2);
    }

    #[test]
    fn test_whole_address_space_range() {
        let range: FakeIpRange = "0.0.0.0/0".parse().unwrap();
        assert_eq!(range.capacity(), u32::MAX - 1);
        assert_eq!(range.host(u32::MAX - 2), Some(Ipv4Addr::new(255, 255, 255, 254)));
        assert_eq!(range.host(u32::MAX - 1), None);

        let dns = FakeDnsTable::new(range);
        assert_eq!(dns.allocate("a.example"), Some(Ipv4Addr::new(0, 0, 0, 1)));
        assert_eq!(dns.allocate("b.example"), Some(Ipv4Addr::new(0, 0, 0, 2)));
    }

    #[test]
    fn test_insert_replaces_previous_binding() {
        let dns = table();
        let ip: IpAddr = "198.18.0.9".parse().unwrap();
        dns.insert(ip, "old.example");
        dns.insert(ip, "new.example");

        assert_eq!(dns.ip_to_host(ip).as_deref(), Some("new.example"));
        assert_eq!(dns.len(), 1);
    }

    #[test]
    fn test_parse_binding() {
        let binding: FakeBinding = "198.18.0.3=Example.Internal.".parse().unwrap();
        assert_eq!(binding.ip, "198.18.0.3".parse::<IpAddr>().unwrap());
        assert_eq!(binding.host, "example.internal");

        assert!("198.18.0.3".parse::<FakeBinding>().is_err());
        assert!("bogus=host".parse::<FakeBinding>().is_err());
        assert!("198.18.0.3=".parse::<FakeBinding>().is_err());
    }
}
