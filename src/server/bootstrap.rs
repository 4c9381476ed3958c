use crate::config::ServerConfig;
use crate::registry::types::HEARTBEAT_INTERVAL_SECS;
use crate::server::{self, ServerState};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const CACHE_JANITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Server lifecycle: init → register → watch → serve → shutdown.
pub async fn run(config: ServerConfig) -> Result<()> {
    init_tracing(&config.log_level, &config.log_format);
    let shutdown = Arc::new(Notify::new());
    let run = run_with_shutdown(config, shutdown.clone());

    tokio::pin!(run);
    tokio::select! {
        result = &mut run => result,
        _ = wait_for_signal() => {
            shutdown.notify_waiters();
            run.await
        }
    }
}

/// Test-friendly entry point: the caller owns the shutdown trigger and
/// tracing installation.
pub async fn run_with_shutdown(config: ServerConfig, shutdown: Arc<Notify>) -> Result<()> {
    // Phase 1: build state (dials redis in the distributed variant).
    let state = ServerState::new(config).await?;
    let cfg = state.config.clone();

    // Phase 2: register this server before any tunnel can be registered,
    // since tunnel records carry the owning server id.
    state.registry.register_server(state.descriptor()).await?;
    info!(
        "bootstrap: server registered, id={}, distributed={}",
        cfg.id,
        state.registry.is_distributed()
    );

    // Phase 3: background loops — all owned here.
    start_heartbeat_loop(&state, &shutdown);
    start_sweeper_loop(&state, &shutdown);
    if state.registry.is_distributed() {
        start_cache_janitor_loop(&state, &shutdown);
        start_invalidation_listener(&state, &shutdown);
    }

    // Phase 4: listeners.
    let public_addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let control_addr: SocketAddr = ([0, 0, 0, 0], cfg.control_port).into();
    let admin_addr: SocketAddr = ([0, 0, 0, 0], cfg.admin_port).into();

    let control_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_control_server(control_addr, state, shutdown).await }
    });
    let admin_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_admin_server(admin_addr, state, shutdown).await }
    });
    let public_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_public_server(public_addr, state, shutdown).await }
    });

    info!(
        "bootstrap: serving, public={}, control={}, admin={}",
        public_addr, control_addr, admin_addr
    );

    // Phase 5: block until shutdown, then tear down in order: listeners
    // first (stop accepting), then every control connection, then the
    // directory entries.
    shutdown.notified().await;
    info!("bootstrap: shutting down");

    if let Err(e) = public_handle.await {
        error!("bootstrap: public task error: {}", e);
    }
    if let Err(e) = control_handle.await {
        error!("bootstrap: control task error: {}", e);
    }
    if let Err(e) = admin_handle.await {
        error!("bootstrap: admin task error: {}", e);
    }

    for conn in state.connections.snapshot() {
        if let Err(e) = state.registry.unregister_tunnel(&conn.sub_domain).await {
            warn!(
                "bootstrap: unregister on shutdown failed, subdomain={}, error={}",
                conn.sub_domain, e
            );
        }
    }
    state.connections.close_all();

    info!("bootstrap: shutdown complete");
    Ok(())
}

pub fn init_tracing(level: &str, format: &str) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false),
            )
            .try_init()
    };

    if result.is_ok() {
        // Keep the writer thread alive for the process lifetime.
        std::mem::forget(guard);
    }
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns a task with the interval/retry loop.
// The registry and connection manager only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Every 5 s: re-upsert this server's descriptor (fresh TTL + load figures)
/// and refresh every locally-owned tunnel so none lapses under its TTL.
fn start_heartbeat_loop(state: &ServerState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(
                std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
                &shutdown,
            )
            .await
            {
                return;
            }

            let active = state.connections.len() as u64;
            if let Err(e) = state.registry.register_server(state.descriptor()).await {
                warn!("heartbeat: server refresh failed, error={}", e);
                continue;
            }
            if let Err(e) = state.registry.update_server_load(active, active).await {
                warn!("heartbeat: load update failed, error={}", e);
            }

            for conn in state.connections.snapshot() {
                match state.registry.refresh_tunnel(&conn.sub_domain).await {
                    Ok(()) => {}
                    Err(crate::error::TunnelError::NotFound) => {
                        // Expired out from under us (or the store restarted):
                        // re-register from the live connection.
                        let record = crate::server::control::tunnel_record_for(&state, &conn);
                        if let Err(e) = state.registry.register_tunnel(record).await {
                            warn!(
                                "heartbeat: tunnel re-register failed, subdomain={}, error={}",
                                conn.sub_domain, e
                            );
                        }
                    }
                    Err(e) => warn!(
                        "heartbeat: tunnel refresh failed, subdomain={}, error={}",
                        conn.sub_domain, e
                    ),
                }
            }

            metrics::gauge!("tungo_tunnels_active").set(active as f64);
            match state.registry.list_servers().await {
                Ok(servers) => {
                    metrics::gauge!("tungo_servers_active").set(servers.len() as f64)
                }
                Err(e) => warn!("heartbeat: server listing failed, error={}", e),
            }
        }
    });
}

/// Every 10 s: evict TTL-lapsed records (in-memory variant; no-op on redis).
fn start_sweeper_loop(state: &ServerState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(SWEEP_INTERVAL, &shutdown).await {
                return;
            }
            state.registry.sweep_expired();
        }
    });
}

/// Every 5 s: janitor pass over the distributed lookup cache.
fn start_cache_janitor_loop(state: &ServerState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(CACHE_JANITOR_INTERVAL, &shutdown).await {
                return;
            }
            state.registry.evict_expired_cache();
        }
    });
}

/// Long-lived pub/sub subscriber driving eager cache invalidation.
fn start_invalidation_listener(state: &ServerState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        state.registry.run_invalidation_listener(shutdown).await;
    });
}

async fn wait_for_signal() {
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
        _ = ctrl_c => info!("bootstrap: received SIGINT, shutting down"),
        _ = terminate => info!("bootstrap: received SIGTERM, shutting down"),
    }
}
