use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tcp2socks::buffer_pool::get_buffer_pool;
use tcp2socks::config::{Cli, TunnelConfig};
use tcp2socks::connection::RelaySupervisor;
use tcp2socks::handler::TcpHandler;
use tcp2socks::resolver::{FakeDns, FakeDnsTable};
use tcp2socks::server::{Server, TargetSource};
use tcp2socks::session::SessionTable;
use tcp2socks::socks::Socks5Dialer;

/// How long shutdown waits for running relays
const DRAIN_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tcp2socks=info,access=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let config = TunnelConfig::from_cli(Cli::parse())?;

    info!("SOCKS5 upstream: {}", config.proxy);
    match config.target {
        Some(target) => info!("Relaying every flow to {}", target),
        None => info!("Relaying flows to their original destination"),
    }

    let fake_dns = Arc::new(FakeDnsTable::new(config.fake_ip_range));
    for binding in &config.fake_hosts {
        if !fake_dns.is_fake_ip(binding.ip) {
            warn!(
                "Fake host {} -> {} is outside {}; it will not be translated",
                binding.ip,
                binding.host,
                config.fake_ip_range
            );
        }
        fake_dns.insert(binding.ip, binding.host.clone());
    }
    if !fake_dns.is_empty() {
        info!("Loaded {} fake-DNS bindings in {}", fake_dns.len(), config.fake_ip_range);
    }

    let supervisor = RelaySupervisor::new(config.max_flows);
    let mut handler = TcpHandler::new(
        config.proxy.host(),
        config.proxy.port(),
        Socks5Dialer::new(config.socks_auth.clone()),
    )
    .with_fake_dns(fake_dns)
    .with_copy_mode(config.copy_mode)
    .with_keepalive(config.keepalive)
    .with_supervisor(supervisor.clone());

    let sessions = if config.stats {
        let sessions = Arc::new(SessionTable::new());
        handler = handler.with_sessions(sessions.clone());
        Some(sessions)
    } else {
        None
    };

    let targets = config
        .target
        .map(TargetSource::Fixed)
        .unwrap_or(TargetSource::OriginalDst);
    let server = Server::bind(config.listen_addr, Arc::new(handler), targets).await?;

    tokio::spawn(monitor(
        supervisor.clone(),
        sessions,
        config.stats_interval,
    ));

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    serving.await??;

    let active = supervisor.running();
    if active > 0 {
        info!("Waiting for {} relays to close...", active);

        for i in 1..=DRAIN_TIMEOUT_SECS {
            if supervisor.drain(Duration::from_secs(1)).await {
                info!("All relays closed gracefully");
                break;
            }

            if i % 5 == 0 {
                info!(
                    "Still waiting for {} relays... ({}/{}s)",
                    supervisor.running(),
                    i,
                    DRAIN_TIMEOUT_SECS
                );
            }
        }

        let remaining = supervisor.running();
        if remaining > 0 {
            warn!("Forced shutdown with {} relays still active", remaining);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Periodically log flow load and session totals
async fn monitor(
    supervisor: RelaySupervisor,
    sessions: Option<Arc<SessionTable>>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    let mut last_active = 0;
    let mut stable_intervals = 0;

    loop {
        interval.tick().await;

        let active = supervisor.active_count();
        if active > 0 && active != last_active {
            info!("Active flows: {}/{}", active, supervisor.max_flows());
        }

        // A high count that never moves usually means relays are stuck
        if active == last_active && active > supervisor.max_flows() / 10 && active > 0 {
            stable_intervals += 1;
            if stable_intervals >= 3 {
                warn!(
                    "Potential flow leak: {} flows stable for {} intervals",
                    active, stable_intervals
                );
            }
        } else {
            stable_intervals = 0;
        }

        if active >= supervisor.max_flows() {
            error!("Flow cap reached: {} active, new flows are refused", active);
        } else if active * 10 >= supervisor.max_flows() * 8 {
            warn!("High flow load: {} of {} active", active, supervisor.max_flows());
        }

        if let Some(sessions) = &sessions {
            let totals = sessions.totals();
            if totals.sessions > 0 {
                info!(
                    "Sessions: {} live, {} bytes up, {} bytes down",
                    totals.sessions, totals.upload_bytes, totals.download_bytes
                );
            }
            for (key, session) in sessions.snapshot() {
                debug!(
                    "Session {} [{}] {} {} -> {}: up {} down {} age {:?}",
                    key,
                    session.network,
                    session.process_name,
                    session.client_addr,
                    session.target_addr,
                    session.upload_bytes(),
                    session.download_bytes(),
                    session.age()
                );
            }
        }

        let pool = get_buffer_pool().stats();
        debug!(
            "Buffer pool: {} buffers, {} bytes pooled",
            pool.buffers_available, pool.total_memory_pooled
        );

        last_active = active;
    }
}
