use crate::error::TunnelError;
use crate::registry::types::{now_unix, ServerRecord, TunnelRecord};
use dashmap::DashMap;
use tracing::debug;

/// Single-node tunnel directory. Everything lives in process memory; a
/// background sweeper (owned by bootstrap) evicts records whose soft TTL
/// lapsed without a refresh.
pub struct MemoryRegistry {
    server_id: String,
    tunnels: DashMap<String, TunnelRecord>,
    servers: DashMap<String, ServerRecord>,
}

impl MemoryRegistry {
    pub fn new(server_id: String) -> Self {
        Self {
            server_id,
            tunnels: DashMap::new(),
            servers: DashMap::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn register_tunnel(&self, mut record: TunnelRecord) {
        record.server_id = self.server_id.clone();
        record.last_seen_at = now_unix();
        if record.created_at == 0 {
            record.created_at = self
                .tunnels
                .get(&record.subdomain)
                .map(|existing| existing.created_at)
                .filter(|&t| t != 0)
                .unwrap_or_else(now_unix);
        }
        debug!(
            "registry: tunnel registered, subdomain={}, client_id={}",
            record.subdomain, record.client_id
        );
        self.tunnels.insert(record.subdomain.clone(), record);
    }

    pub fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, TunnelError> {
        let record = self
            .tunnels
            .get(subdomain)
            .map(|r| r.clone())
            .ok_or(TunnelError::NotFound)?;
        if record.is_expired(now_unix()) {
            return Err(TunnelError::Expired);
        }
        Ok(record)
    }

    pub fn unregister_tunnel(&self, subdomain: &str) {
        if self.tunnels.remove(subdomain).is_some() {
            debug!("registry: tunnel unregistered, subdomain={}", subdomain);
        }
    }

    pub fn refresh_tunnel(&self, subdomain: &str) -> Result<(), TunnelError> {
        match self.tunnels.get_mut(subdomain) {
            Some(mut record) => {
                record.last_seen_at = now_unix();
                Ok(())
            }
            None => Err(TunnelError::NotFound),
        }
    }

    pub fn list_tunnels(&self) -> Vec<TunnelRecord> {
        let now = now_unix();
        self.tunnels
            .iter()
            .filter(|r| !r.is_expired(now))
            .map(|r| r.clone())
            .collect()
    }

    pub fn register_server(&self, mut record: ServerRecord) {
        record.last_heartbeat = now_unix();
        self.servers.insert(record.server_id.clone(), record);
    }

    pub fn get_server(&self, server_id: &str) -> Result<ServerRecord, TunnelError> {
        let record = self
            .servers
            .get(server_id)
            .map(|r| r.clone())
            .ok_or(TunnelError::NotFound)?;
        if record.is_expired(now_unix()) {
            return Err(TunnelError::Expired);
        }
        Ok(record)
    }

    pub fn list_servers(&self) -> Vec<ServerRecord> {
        let now = now_unix();
        self.servers
            .iter()
            .filter(|r| !r.is_expired(now))
            .map(|r| r.clone())
            .collect()
    }

    /// Single node: the least loaded server is always this one.
    pub fn pick_least_loaded_server(&self) -> Result<ServerRecord, TunnelError> {
        self.get_server(&self.server_id)
    }

    pub fn update_server_load(&self, active_connections: u64) -> Result<(), TunnelError> {
        match self.servers.get_mut(&self.server_id) {
            Some(mut record) => {
                record.active_connections = active_connections;
                record.active_tunnels = self.tunnels.len() as u64;
                record.last_heartbeat = now_unix();
                Ok(())
            }
            None => Err(TunnelError::NotFound),
        }
    }

    /// Sweeper pass: drop tunnels and servers past their TTL. Owned by a
    /// 10 s bootstrap loop.
    pub fn sweep_expired(&self) {
        let now = now_unix();
        let before = self.tunnels.len();
        self.tunnels.retain(|_, r| !r.is_expired(now));
        let evicted = before - self.tunnels.len();
        if evicted > 0 {
            debug!("registry: sweeper evicted {} expired tunnels", evicted);
        }
        self.servers.retain(|_, r| !r.is_expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::TUNNEL_TTL_SECS;

    fn record(sub: &str) -> TunnelRecord {
        TunnelRecord {
            subdomain: sub.into(),
            server_id: String::new(),
            server_host: "127.0.0.1".into(),
            client_id: "c1".into(),
            created_at: 0,
            last_seen_at: 0,
            proxy_port: 8080,
            control_port: 5555,
            password_hash: None,
        }
    }

    fn server(id: &str, load: u64) -> ServerRecord {
        ServerRecord {
            server_id: id.into(),
            host: "127.0.0.1".into(),
            proxy_port: 8080,
            control_port: 5555,
            last_heartbeat: 0,
            active_tunnels: 0,
            active_connections: load,
        }
    }

    #[test]
    fn test_register_stamps_owner_and_times() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_tunnel(record("demo"));
        let got = reg.get_tunnel("demo").unwrap();
        assert_eq!(got.server_id, "s1");
        assert!(got.created_at > 0);
        assert!(got.last_seen_at > 0);
    }

    #[test]
    fn test_reregister_preserves_created_at() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_tunnel(record("demo"));
        let first = reg.get_tunnel("demo").unwrap();
        reg.register_tunnel(record("demo"));
        let second = reg.get_tunnel("demo").unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn test_missing_tunnel_is_not_found() {
        let reg = MemoryRegistry::new("s1".into());
        assert!(matches!(reg.get_tunnel("nope"), Err(TunnelError::NotFound)));
    }

    #[test]
    fn test_expired_tunnel_reported_and_swept() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_tunnel(record("demo"));
        reg.tunnels.get_mut("demo").unwrap().last_seen_at =
            now_unix() - TUNNEL_TTL_SECS as i64 - 1;
        assert!(matches!(reg.get_tunnel("demo"), Err(TunnelError::Expired)));
        assert!(reg.list_tunnels().is_empty());
        reg.sweep_expired();
        assert!(matches!(reg.get_tunnel("demo"), Err(TunnelError::NotFound)));
    }

    #[test]
    fn test_refresh_extends_lifetime() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_tunnel(record("demo"));
        reg.tunnels.get_mut("demo").unwrap().last_seen_at =
            now_unix() - TUNNEL_TTL_SECS as i64 + 2;
        reg.refresh_tunnel("demo").unwrap();
        assert!(reg.get_tunnel("demo").is_ok());
        assert!(matches!(
            reg.refresh_tunnel("absent"),
            Err(TunnelError::NotFound)
        ));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_tunnel(record("demo"));
        reg.unregister_tunnel("demo");
        reg.unregister_tunnel("demo");
        assert!(matches!(reg.get_tunnel("demo"), Err(TunnelError::NotFound)));
    }

    #[test]
    fn test_server_load_update() {
        let reg = MemoryRegistry::new("s1".into());
        reg.register_server(server("s1", 0));
        reg.register_tunnel(record("demo"));
        reg.update_server_load(4).unwrap();
        let got = reg.pick_least_loaded_server().unwrap();
        assert_eq!(got.active_connections, 4);
        assert_eq!(got.active_tunnels, 1);
    }
}
