use crate::config::Config;
use crate::metrics::Metrics;
use crate::server::{self, ServerState};
use crate::upstream::health;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Either listen address, when set,
/// overrides the port resolved from the environment.
pub struct BootstrapArgs {
    pub listen: Option<String>,
    pub metrics_listen: Option<String>,
}

/// Service lifecycle: init → load pool → watch health → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = Config::from_env();
    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.proxy_port));
    let metrics_listen = args
        .metrics_listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.metrics_port));

    let metrics = Metrics::install();
    let state = ServerState::new(config, metrics);

    let shutdown = Arc::new(Notify::new());
    start_health_check_loop(&state, &shutdown);
    start_admin_server(&state, &metrics_listen)?;

    let listener = bind_with_backlog(listen.parse()?, 4096)?;
    tracing::info!("server: proxy listening, addr={}", listen);
    println!("ProxyGuard | Port {}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(listener, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    // Wait for the proxy to finish draining in-flight tunnels.
    if let Err(e) = proxy_handle.await? {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Bind a listener with an explicit accept backlog — the default is too
/// small for connection bursts against a tunneling proxy.
fn bind_with_backlog(addr: SocketAddr, backlog: i32) -> Result<tokio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(socket.into())?)
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Owner of the periodic health loop: an immediate full probe round at
/// startup, then every interval a file reload check, a probe round, and a
/// sticky-map prune.
fn start_health_check_loop(state: &ServerState, shutdown: &Arc<Notify>) {
    let registry = state.registry.clone();
    let interval = state.config.health_check_interval;
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        tracing::info!("health: starting health check loop");
        health::run_probe_round(&registry).await;

        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            registry.reload_if_changed();
            health::run_probe_round(&registry).await;
            registry.prune_sticky();
        }
    });
}

fn start_admin_server(state: &ServerState, listen: &str) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let state = state.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => {
                tracing::info!("server: admin listening, addr={}", addr);
                l
            }
            Err(e) => {
                tracing::error!("server: admin bind failed, addr={}, error={}", addr, e);
                return;
            }
        };
        if let Err(e) = server::run_admin_server(listener, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
    Ok(())
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, draining connections..."),
        _ = terminate => tracing::info!("server: received SIGTERM, draining connections..."),
    }

    // Signal the accept loop and every background loop to stop.
    shutdown.notify_waiters();
}
