use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TunnelError};
use crate::target::Network;

/// Process name recorded when the owner of a socket cannot be determined
pub const UNKNOWN_PROCESS: &str = "N/A";

/// Maps a local socket address to the name of the process that owns it
pub trait ProcessLookup: Send + Sync {
    fn command_name(&self, network: Network, local: SocketAddr) -> Result<String>;
}

/// `/proc` based process lookup
///
/// The socket inode is found in `/proc/net/{tcp,tcp6,udp,udp6}` and matched
/// against the `socket:[inode]` links under `/proc/<pid>/fd`. Only Linux is
/// supported; elsewhere every lookup fails.
#[derive(Debug, Clone)]
pub struct ProcLookup {
    proc_root: PathBuf,
}

impl ProcLookup {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Default for ProcLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ProcessLookup for ProcLookup {
    fn command_name(&self, network: Network, local: SocketAddr) -> Result<String> {
        let inode = self.find_inode(network, local)?;
        let pid = self.find_owner(inode)?;
        let comm = std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))
            .map_err(|e| TunnelError::ProcessLookup(format!("read comm of {}: {}", pid, e)))?;
        Ok(comm.trim_end().to_string())
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessLookup for ProcLookup {
    fn command_name(&self, _network: Network, _local: SocketAddr) -> Result<String> {
        Err(TunnelError::ProcessLookup(
            "process lookup is only supported on Linux".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
impl ProcLookup {
    fn find_inode(&self, network: Network, local: SocketAddr) -> Result<u64> {
        let tables = match network {
            Network::Tcp => ["tcp", "tcp6"],
            Network::Udp => ["udp", "udp6"],
        };

        for table in tables {
            let path = self.proc_root.join("net").join(table);
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let is_ipv6 = table.ends_with('6');
            if let Some(inode) = parse_socket_table(&content, is_ipv6)
                .into_iter()
                .find(|entry| addr_matches(entry.local, local))
                .map(|entry| entry.inode)
            {
                return Ok(inode);
            }
        }

        Err(TunnelError::ProcessLookup(format!(
            "no {} socket bound to {}",
            network, local
        )))
    }

    fn find_owner(&self, inode: u64) -> Result<u32> {
        let link = format!("socket:[{}]", inode);
        let entries = std::fs::read_dir(&self.proc_root)
            .map_err(|e| TunnelError::ProcessLookup(format!("read {:?}: {}", self.proc_root, e)))?;

        for entry in entries.flatten() {
            let pid: u32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            // Processes of other users are unreadable; skip them
            let fds = match std::fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };
            for fd in fds.flatten() {
                if let Ok(target) = std::fs::read_link(fd.path()) {
                    if target.as_os_str() == link.as_str() {
                        return Ok(pid);
                    }
                }
            }
        }

        Err(TunnelError::ProcessLookup(format!(
            "no process holds socket inode {}",
            inode
        )))
    }
}

/// One row of a `/proc/net/*` socket table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketEntry {
    local: SocketAddr,
    inode: u64,
}

/// Parse the rows of `/proc/net/{tcp,udp}[6]`, skipping malformed ones
///
/// ```text
///   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
/// ```
fn parse_socket_table(content: &str, is_ipv6: bool) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 10 {
                return None;
            }
            let local = parse_hex_socket_addr(parts[1], is_ipv6)?;
            let inode = parts[9].parse().ok()?;
            Some(SocketEntry { local, inode })
        })
        .collect()
}

/// Parse `ADDR:PORT` where ADDR is host-order 32-bit words in hex
fn parse_hex_socket_addr(s: &str, is_ipv6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = if is_ipv6 {
        if addr_hex.len() != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for (i, chunk) in octets.chunks_mut(4).enumerate() {
            let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        if addr_hex.len() != 8 {
            return None;
        }
        let word = u32::from_str_radix(addr_hex, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
    };

    Some(SocketAddr::new(ip, port))
}

/// Compare socket addresses, treating IPv4-mapped IPv6 as IPv4
fn addr_matches(entry: SocketAddr, want: SocketAddr) -> bool {
    fn canonical(ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        }
    }
    entry.port() == want.port() && canonical(entry.ip()) == canonical(want.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_hex_socket_addr_v4() {
        let addr = parse_hex_socket_addr("0100007F:1F90", false).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_hex_socket_addr_v6_loopback() {
        let addr =
            parse_hex_socket_addr("00000000000000000000000001000000:0050", true).unwrap();
        assert_eq!(addr, "[::1]:80".parse().unwrap());
    }

    #[test]
    fn test_parse_hex_socket_addr_rejects_garbage() {
        assert!(parse_hex_socket_addr("0100007F", false).is_none());
        assert!(parse_hex_socket_addr("ZZ00007F:1F90", false).is_none());
        assert!(parse_hex_socket_addr("0100007F:1F90", true).is_none());
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_parse_socket_table() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0200000A:C350 0100000A:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 67890 1 0000000000000000 20 4 30 10 -1
   2: truncated line
";
        let entries = parse_socket_table(content, false);
        assert_eq!(
            entries,
            vec![
                SocketEntry {
                    local: "127.0.0.1:8080".parse().unwrap(),
                    inode: 12345,
                },
                SocketEntry {
                    local: "10.0.0.2:50000".parse().unwrap(),
                    inode: 67890,
                },
            ]
        );
    }

    #[test]
    fn test_addr_matches_ipv4_mapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.2]:50000".parse().unwrap();
        let plain: SocketAddr = "10.0.0.2:50000".parse().unwrap();
        assert!(addr_matches(mapped, plain));
        assert!(!addr_matches(mapped, "10.0.0.2:50001".parse().unwrap()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lookup_finds_own_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _server = listener.accept().unwrap();

        let own = std::fs::read_to_string("/proc/self/comm").unwrap();
        let name = ProcLookup::new()
            .command_name(Network::Tcp, client.local_addr().unwrap())
            .unwrap();
        assert_eq!(name, own.trim_end());
    }

    #[test]
    fn test_lookup_unknown_socket_fails() {
        let lookup = ProcLookup {
            proc_root: PathBuf::from("/nonexistent-proc-root"),
        };
        let err = lookup
            .command_name(Network::Udp, "127.0.0.1:9".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, TunnelError::ProcessLookup(_)));
    }
}
