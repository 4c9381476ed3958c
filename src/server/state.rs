use crate::config::ServerConfig;
use crate::conn::ConnectionManager;
use crate::metrics::Metrics;
use crate::proxy::peer::PeerProxy;
use crate::proxy::DomainMatcher;
use crate::registry::Registry;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared server state, cheaply cloneable. One instance per process wires
/// the registry, the connection index, the peer client, and metrics.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub connections: Arc<ConnectionManager>,
    pub domain: Arc<DomainMatcher>,
    pub peer: PeerProxy,
    pub metrics: Metrics,
}

impl ServerState {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let registry = if config.redis_url.is_empty() {
            info!("registry: in-memory variant selected");
            Registry::in_memory(config.id.clone())
        } else {
            match Registry::redis(&config.redis_url, config.id.clone()).await {
                Ok(registry) => registry,
                Err(e) if !config.redis_required => {
                    warn!(
                        "registry: redis unreachable, falling back to in-memory, error={}",
                        e
                    );
                    Registry::in_memory(config.id.clone())
                }
                Err(e) => {
                    anyhow::bail!("registry: redis unreachable and redis_required=true: {}", e)
                }
            }
        };

        let domain = Arc::new(DomainMatcher::new(&config.domain));
        let connections = Arc::new(ConnectionManager::new(config.max_connections));
        let peer = PeerProxy::new(std::time::Duration::from_secs(config.idle_timeout_secs.max(1)));

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            connections,
            domain,
            peer,
            metrics,
        })
    }

    /// This server's directory descriptor with current load figures.
    pub fn descriptor(&self) -> crate::registry::ServerRecord {
        crate::registry::ServerRecord {
            server_id: self.config.id.clone(),
            host: self.config.host.clone(),
            proxy_port: self.config.port,
            control_port: self.config.control_port,
            last_heartbeat: crate::registry::types::now_unix(),
            active_tunnels: self.connections.len() as u64,
            active_connections: self.connections.len() as u64,
        }
    }
}
