mod admin;
pub mod bootstrap;
pub mod control;
mod state;

pub use state::ServerState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the public proxy listener with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete before
/// dropping them.
pub async fn run_public_server(
    listen: SocketAddr,
    state: ServerState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let drain_timeout = std::time::Duration::from_secs(state.config.write_timeout_secs.max(1));
    let header_read_timeout = std::time::Duration::from_secs(state.config.read_timeout_secs.max(1));

    let listener = TcpListener::bind(listen).await?;
    info!("server: public proxy listening, addr={}", listen);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: public: stop accepting, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: public: accept failed, error={}", e);
                continue;
            }
        };

        active_conns.fetch_add(1, Ordering::Relaxed);
        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { proxy::handle_public_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .timer(TokioTimer::new())
                .keep_alive(true)
                .header_read_timeout(header_read_timeout)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: public: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain(&active_conns, drain_timeout, "public").await;
    Ok(())
}

/// Run the control listener: plain HTTP that upgrades `/ws` to the tunnel
/// protocol. Connections accepted here are long-lived; shutdown closes them
/// through the connection manager, so no drain phase is needed.
pub async fn run_control_server(
    listen: SocketAddr,
    state: ServerState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("server: control listening, addr={}", listen);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: control: stop accepting");
                return Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: control: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { control::handle_control(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: control: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }
        });
    }
}

/// Run the admin server for health, metrics, and introspection.
pub async fn run_admin_server(
    listen: SocketAddr,
    state: ServerState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("server: admin listening, addr={}", listen);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => return Ok(()),
        };

        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

async fn drain(active_conns: &Arc<AtomicI64>, timeout: std::time::Duration, name: &str) {
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return;
    }
    info!("server: {}: waiting for {} connections to drain", name, active);
    let wait = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(_) => info!("server: {}: all connections drained", name),
        Err(_) => info!(
            "server: {}: drain timeout, {} connections still active",
            name,
            active_conns.load(Ordering::Relaxed)
        ),
    }
}
