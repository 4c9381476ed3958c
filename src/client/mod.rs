pub mod engine;
pub mod origin;

use crate::config::ClientConfig;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Client lifecycle: run the reconnecting engine until a termination signal.
pub async fn run(config: ClientConfig) -> Result<()> {
    crate::server::bootstrap::init_tracing(&config.log_level, &config.log_format);

    let shutdown = Arc::new(Notify::new());
    let engine = engine::run(config, shutdown.clone());

    tokio::pin!(engine);
    tokio::select! {
        _ = &mut engine => {}
        _ = tokio::signal::ctrl_c() => {
            info!("client: received SIGINT, shutting down");
            shutdown.notify_waiters();
            engine.await;
        }
    }
    Ok(())
}

/// Test-friendly entry point: the caller owns shutdown and tracing.
pub async fn run_with_shutdown(config: ClientConfig, shutdown: Arc<Notify>) {
    engine::run(config, shutdown).await;
}
