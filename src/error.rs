use std::io;

/// Error type for tunnel setup and relay operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The upstream proxy address could not be built from host/port
    #[error("invalid proxy address {host}:{port}: {reason}")]
    Configuration {
        host: String,
        port: u16,
        reason: String,
    },

    /// Upstream proxy unreachable or refused the CONNECT
    #[error("dial {target} via {proxy} failed: {reason}")]
    Dial {
        proxy: String,
        target: String,
        reason: String,
    },

    #[error("network {0} is not supported by the proxy dialer")]
    Unsupported(String),

    #[error("too many active flows ({0})")]
    Overloaded(usize),

    /// Read or write deadline expired; always retried
    #[error("i/o deadline expired")]
    TransientTimeout,

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("stream error: {0}")]
    Stream(#[from] io::Error),

    #[error("process lookup failed: {0}")]
    ProcessLookup(String),
}

impl TunnelError {
    /// Whether this error terminates a relay direction
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TunnelError::TransientTimeout)
    }
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
