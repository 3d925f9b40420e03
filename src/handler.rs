use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{FlowGuard, RelaySupervisor};
use crate::copy::CopyMode;
use crate::error::{Result, TunnelError};
use crate::lsof::{ProcLookup, ProcessLookup, UNKNOWN_PROCESS};
use crate::relay::relay;
use crate::resolver::{resolve_host, FakeDns};
use crate::session::{Session, SessionStater, StreamKey};
use crate::socks::{ProxyAddr, ProxyDialer};
use crate::stream::FlowStream;
use crate::target::{join_host_port, Network, Target};
use crate::traffic::SessionStream;

/// Default TCP keepalive period applied to both ends of a flow
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Tag recorded in access logs for flows sent to the upstream proxy
pub const PROXY_TAG: &str = "proxy";

/// Setup failure from [`TcpHandler::handle`]
///
/// The local stream comes back untouched; the caller decides how to close it.
pub struct HandleError<L> {
    pub error: TunnelError,
    pub local: L,
}

impl<L> HandleError<L> {
    pub fn into_parts(self) -> (TunnelError, L) {
        (self.error, self.local)
    }
}

impl<L> fmt::Debug for HandleError<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<L> fmt::Display for HandleError<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// Handles intercepted TCP connections by relaying them through a proxy
pub struct TcpHandler<D> {
    proxy_host: String,
    proxy_port: u16,
    dialer: D,
    fake_dns: Option<Arc<dyn FakeDns>>,
    sessions: Option<Arc<dyn SessionStater>>,
    process_lookup: Arc<dyn ProcessLookup>,
    copier: CopyMode,
    keepalive: Duration,
    supervisor: RelaySupervisor,
}

impl<D: ProxyDialer> TcpHandler<D> {
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16, dialer: D) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            dialer,
            fake_dns: None,
            sessions: None,
            process_lookup: Arc::new(ProcLookup::new()),
            copier: CopyMode::default(),
            keepalive: DEFAULT_KEEPALIVE,
            supervisor: RelaySupervisor::default(),
        }
    }

    /// Translate synthetic destination addresses through `fake_dns`
    pub fn with_fake_dns(mut self, fake_dns: Arc<dyn FakeDns>) -> Self {
        self.fake_dns = Some(fake_dns);
        self
    }

    /// Track every relayed flow as a session in `sessions`
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStater>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_process_lookup(mut self, lookup: Arc<dyn ProcessLookup>) -> Self {
        self.process_lookup = lookup;
        self
    }

    pub fn with_copy_mode(mut self, copier: CopyMode) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_keepalive(mut self, period: Duration) -> Self {
        self.keepalive = period;
        self
    }

    pub fn with_supervisor(mut self, supervisor: RelaySupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn supervisor(&self) -> &RelaySupervisor {
        &self.supervisor
    }

    /// Set up a flow for `local` towards `target` and start relaying it
    ///
    /// Returns once the remote side is connected and the relay is running in
    /// the background. On error nothing was started and `local` is handed
    /// back open in the [`HandleError`].
    pub async fn handle<L: FlowStream>(
        &self,
        local: L,
        target: Target,
    ) -> std::result::Result<(), HandleError<L>> {
        let (guard, remote, target_addr) = match self.connect(&target).await {
            Ok(connected) => connected,
            Err(error) => return Err(HandleError { error, local }),
        };

        let key = StreamKey::next();
        let client = local.peer_addr();
        let client_addr = client
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());

        let mut process = UNKNOWN_PROCESS.to_string();
        let remote: Box<dyn FlowStream> = match &self.sessions {
            Some(sessions) => {
                process = self.lookup_process(target.network, client).await;
                let session = Arc::new(Session::new(
                    process.clone(),
                    target.network,
                    client_addr.clone(),
                    target_addr.clone(),
                ));
                sessions.add_session(key, Arc::clone(&session));
                Box::new(SessionStream::new(remote, session))
            }
            None => Box::new(remote),
        };

        set_keepalive(&local, self.keepalive, "local");
        set_keepalive(&remote, self.keepalive, "remote");

        let sessions = self.sessions.clone();
        let copier = self.copier;
        self.supervisor.spawn(guard, async move {
            let first = relay(local, remote, key, sessions, copier).await;
            debug!("Flow {} closed, {} finished first", key, first);
        });

        log_access(&process, PROXY_TAG, target.network, &client_addr, &target_addr);
        Ok(())
    }

    /// Reserve a flow slot and dial the destination through the proxy
    async fn connect(&self, target: &Target) -> Result<(FlowGuard, D::Stream, String)> {
        let guard = self.supervisor.try_acquire()?;
        let proxy = ProxyAddr::new(&self.proxy_host, self.proxy_port)?;

        // Replace with a domain name if the target address is a fake IP
        let target_host = resolve_host(self.fake_dns.as_deref(), target.ip());
        let target_addr = join_host_port(&target_host, target.port());

        let remote = self
            .dialer
            .dial(&proxy, target.network, &target_addr)
            .await?;
        Ok((guard, remote, target_addr))
    }

    async fn lookup_process(&self, network: Network, client: Option<SocketAddr>) -> String {
        let Some(client) = client else {
            return UNKNOWN_PROCESS.to_string();
        };

        let lookup = Arc::clone(&self.process_lookup);
        match tokio::task::spawn_blocking(move || lookup.command_name(network, client)).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                debug!("Process lookup for {} failed: {}", client, e);
                UNKNOWN_PROCESS.to_string()
            }
            Err(e) => {
                debug!("Process lookup for {} aborted: {}", client, e);
                UNKNOWN_PROCESS.to_string()
            }
        }
    }
}

fn set_keepalive<S: FlowStream + ?Sized>(stream: &S, period: Duration, side: &str) {
    match stream.set_keepalive(period) {
        Ok(true) => {}
        Ok(false) => debug!("Keepalive not supported on {} stream", side),
        Err(e) => warn!("Failed to enable keepalive on {} stream: {}", side, e),
    }
}

/// Emit one access record for a relayed flow
pub fn log_access(process: &str, tag: &str, network: Network, client: &str, destination: &str) {
    info!(
        target: "access",
        process = process,
        tag = tag,
        network = %network,
        client = client,
        destination = destination,
        "[{}] {} {} -> {} via {}",
        network,
        process,
        client,
        destination,
        tag
    );
}
