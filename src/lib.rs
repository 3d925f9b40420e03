pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod handler;
pub mod lsof;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod session;
pub mod socks;
pub mod stream;
pub mod target;
pub mod traffic;

pub use copy::{CopyMode, IoTimeouts};
pub use error::{Result, TunnelError};
pub use handler::{HandleError, TcpHandler};
pub use relay::relay;
pub use resolver::{FakeDns, FakeDnsTable};
pub use session::{Session, SessionStater, SessionTable, StreamKey};
pub use socks::{ProxyDialer, Socks5Dialer};
pub use stream::FlowStream;
pub use target::{Network, Target};
