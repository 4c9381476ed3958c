pub mod cache;
pub mod memory;
pub mod redis;
pub mod types;

pub use types::{ServerRecord, TunnelRecord};

use crate::error::TunnelError;
use memory::MemoryRegistry;
use self::redis::RedisRegistry;
use std::sync::Arc;
use tokio::sync::Notify;

/// Enum-based registry: no trait objects, no dynamic dispatch.
///
/// The in-memory variant backs single-node deployments at zero distributed
/// cost; the redis variant shares the directory across a cluster. Both honor
/// the same contract: TTL-bounded records, idempotent upserts, absence is
/// authoritative.
pub enum Registry {
    Memory(MemoryRegistry),
    Redis(RedisRegistry),
}

impl Registry {
    pub fn in_memory(server_id: String) -> Self {
        Self::Memory(MemoryRegistry::new(server_id))
    }

    pub async fn redis(url: &str, server_id: String) -> Result<Self, TunnelError> {
        Ok(Self::Redis(RedisRegistry::connect(url, server_id).await?))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Redis(_))
    }

    pub fn server_id(&self) -> &str {
        match self {
            Self::Memory(r) => r.server_id(),
            Self::Redis(r) => r.server_id(),
        }
    }

    /// Idempotent upsert keyed by subdomain. Stamps this server as owner and
    /// refreshes `last_seen_at`; `created_at` survives re-registration.
    pub async fn register_tunnel(&self, record: TunnelRecord) -> Result<(), TunnelError> {
        match self {
            Self::Memory(r) => {
                r.register_tunnel(record);
                Ok(())
            }
            Self::Redis(r) => r.register_tunnel(record).await,
        }
    }

    pub async fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, TunnelError> {
        match self {
            Self::Memory(r) => r.get_tunnel(subdomain),
            Self::Redis(r) => r.get_tunnel(subdomain).await,
        }
    }

    /// Unconditional delete; absent is not an error.
    pub async fn unregister_tunnel(&self, subdomain: &str) -> Result<(), TunnelError> {
        match self {
            Self::Memory(r) => {
                r.unregister_tunnel(subdomain);
                Ok(())
            }
            Self::Redis(r) => r.unregister_tunnel(subdomain).await,
        }
    }

    pub async fn refresh_tunnel(&self, subdomain: &str) -> Result<(), TunnelError> {
        match self {
            Self::Memory(r) => r.refresh_tunnel(subdomain),
            Self::Redis(r) => r.refresh_tunnel(subdomain).await,
        }
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, TunnelError> {
        match self {
            Self::Memory(r) => Ok(r.list_tunnels()),
            Self::Redis(r) => r.list_tunnels().await,
        }
    }

    pub async fn is_local(&self, subdomain: &str) -> bool {
        match self {
            Self::Memory(r) => r.get_tunnel(subdomain).is_ok(),
            Self::Redis(r) => r.is_local(subdomain).await,
        }
    }

    pub async fn register_server(&self, record: ServerRecord) -> Result<(), TunnelError> {
        match self {
            Self::Memory(r) => {
                r.register_server(record);
                Ok(())
            }
            Self::Redis(r) => r.register_server(record).await,
        }
    }

    pub async fn get_server(&self, server_id: &str) -> Result<ServerRecord, TunnelError> {
        match self {
            Self::Memory(r) => r.get_server(server_id),
            Self::Redis(r) => r.get_server(server_id).await,
        }
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>, TunnelError> {
        match self {
            Self::Memory(r) => Ok(r.list_servers()),
            Self::Redis(r) => r.list_servers().await,
        }
    }

    pub async fn pick_least_loaded_server(&self) -> Result<ServerRecord, TunnelError> {
        match self {
            Self::Memory(r) => r.pick_least_loaded_server(),
            Self::Redis(r) => r.pick_least_loaded_server().await,
        }
    }

    pub async fn update_server_load(
        &self,
        active_connections: u64,
        active_tunnels: u64,
    ) -> Result<(), TunnelError> {
        match self {
            Self::Memory(r) => {
                r.update_server_load(active_connections)?;
                Ok(())
            }
            Self::Redis(r) => r.update_server_load(active_connections, active_tunnels).await,
        }
    }

    /// In-memory variant: evict TTL-lapsed records. No-op on redis, where
    /// per-key TTLs do the same job.
    pub fn sweep_expired(&self) {
        if let Self::Memory(r) = self {
            r.sweep_expired();
        }
    }

    /// Distributed variant: janitor pass over the lookup cache.
    pub fn evict_expired_cache(&self) {
        if let Self::Redis(r) = self {
            r.cache().evict_expired();
        }
    }

    /// Distributed variant: block on the pub/sub invalidation feed until
    /// shutdown. Immediately returns for the in-memory variant.
    pub async fn run_invalidation_listener(&self, shutdown: Arc<Notify>) {
        if let Self::Redis(r) = self {
            r.run_invalidation_listener(shutdown).await;
        }
    }
}
