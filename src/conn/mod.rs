pub mod connection;
pub mod stream;

pub use connection::ControlConnection;
pub use stream::{Delivery, TunnelStream};

use crate::error::TunnelError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Maps {
    clients: HashMap<String, Arc<ControlConnection>>,
    subdomains: HashMap<String, String>,
}

/// Per-server index of live control connections.
///
/// Both maps live under one lock so admission and removal are atomic across
/// them. The lock is sync, never held across an await, and no stream or
/// registry operation runs while it is held; connection teardown revokes
/// stream liveness only after the lock is released.
pub struct ConnectionManager {
    maps: RwLock<Maps>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            max_connections,
        }
    }

    /// Admit a connection. Fails when the server is full or the subdomain is
    /// held by a different client.
    pub fn add(&self, conn: Arc<ControlConnection>) -> Result<(), TunnelError> {
        let mut maps = self.maps.write().expect("connection maps lock poisoned");
        if maps.clients.len() >= self.max_connections {
            return Err(TunnelError::LimitReached);
        }
        if let Some(owner) = maps.subdomains.get(&conn.sub_domain) {
            if owner != &conn.client_id {
                return Err(TunnelError::SubdomainInUse(conn.sub_domain.clone()));
            }
        }
        maps.subdomains
            .insert(conn.sub_domain.clone(), conn.client_id.clone());
        maps.clients.insert(conn.client_id.clone(), conn);
        Ok(())
    }

    /// Remove a connection and revoke every stream under it. The maps update
    /// atomically; liveness revocation happens after the lock drops.
    pub fn remove(&self, client_id: &str) -> Option<Arc<ControlConnection>> {
        let conn = {
            let mut maps = self.maps.write().expect("connection maps lock poisoned");
            let conn = maps.clients.remove(client_id)?;
            // Guard against a reconnect having already reclaimed the name.
            if maps.subdomains.get(&conn.sub_domain) == Some(&conn.client_id) {
                maps.subdomains.remove(&conn.sub_domain);
            }
            conn
        };
        conn.close();
        Some(conn)
    }

    /// Remove exactly this connection handle. A no-op when a reconnect has
    /// already replaced the entry under the same client id, so a stale
    /// teardown can never evict the live successor.
    pub fn remove_conn(&self, conn: &Arc<ControlConnection>) -> bool {
        let removed = {
            let mut maps = self.maps.write().expect("connection maps lock poisoned");
            match maps.clients.get(&conn.client_id) {
                Some(existing) if Arc::ptr_eq(existing, conn) => {
                    maps.clients.remove(&conn.client_id);
                    if maps.subdomains.get(&conn.sub_domain) == Some(&conn.client_id) {
                        maps.subdomains.remove(&conn.sub_domain);
                    }
                    true
                }
                _ => false,
            }
        };
        if removed {
            conn.close();
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ControlConnection>> {
        self.maps
            .read()
            .expect("connection maps lock poisoned")
            .clients
            .get(client_id)
            .cloned()
    }

    pub fn get_by_subdomain(&self, sub_domain: &str) -> Option<Arc<ControlConnection>> {
        let maps = self.maps.read().expect("connection maps lock poisoned");
        let client_id = maps.subdomains.get(sub_domain)?;
        maps.clients.get(client_id).cloned()
    }

    pub fn is_subdomain_taken(&self, sub_domain: &str) -> bool {
        self.maps
            .read()
            .expect("connection maps lock poisoned")
            .subdomains
            .contains_key(sub_domain)
    }

    pub fn len(&self) -> usize {
        self.maps
            .read()
            .expect("connection maps lock poisoned")
            .clients
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<ControlConnection>> {
        self.maps
            .read()
            .expect("connection maps lock poisoned")
            .clients
            .values()
            .cloned()
            .collect()
    }

    /// Close every connection. Used by process shutdown after the listeners
    /// stop accepting.
    pub fn close_all(&self) {
        let drained: Vec<Arc<ControlConnection>> = {
            let mut maps = self.maps.write().expect("connection maps lock poisoned");
            maps.subdomains.clear();
            maps.clients.drain().map(|(_, c)| c).collect()
        };
        for conn in drained {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(client_id: &str, sub: &str) -> Arc<ControlConnection> {
        ControlConnection::new(client_id.into(), sub.into(), None, None).0
    }

    #[test]
    fn test_add_and_lookup() {
        let mgr = ConnectionManager::new(8);
        mgr.add(conn("c1", "demo")).unwrap();
        assert!(mgr.get("c1").is_some());
        assert_eq!(mgr.get_by_subdomain("demo").unwrap().client_id, "c1");
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_subdomain_conflict_rejected() {
        let mgr = ConnectionManager::new(8);
        mgr.add(conn("c1", "shared")).unwrap();
        let err = mgr.add(conn("c2", "shared")).unwrap_err();
        assert!(matches!(err, TunnelError::SubdomainInUse(_)));
        // Same client id may re-admit (reconnect before removal).
        mgr.add(conn("c1", "shared")).unwrap();
    }

    #[test]
    fn test_limit_reached() {
        let mgr = ConnectionManager::new(1);
        mgr.add(conn("c1", "a")).unwrap();
        assert!(matches!(
            mgr.add(conn("c2", "b")),
            Err(TunnelError::LimitReached)
        ));
    }

    #[test]
    fn test_remove_is_atomic_and_revokes_streams() {
        let mgr = ConnectionManager::new(8);
        let c = conn("c1", "demo");
        mgr.add(c.clone()).unwrap();
        let (stream, _rx) = c.add_stream("s1", "http", "1.2.3.4:5");

        let removed = mgr.remove("c1").unwrap();
        assert!(removed.is_closed());
        assert!(stream.is_closed());
        assert!(mgr.get("c1").is_none());
        assert!(!mgr.is_subdomain_taken("demo"));
        assert!(mgr.remove("c1").is_none());
    }

    #[test]
    fn test_remove_does_not_evict_reclaimed_subdomain() {
        let mgr = ConnectionManager::new(8);
        let old = conn("c-old", "demo");
        mgr.add(old.clone()).unwrap();
        // Old mapping is torn down first, then a new client claims the name.
        mgr.remove("c-old");
        mgr.add(conn("c-new", "demo")).unwrap();
        // Removing the stale handle again must not unmap the new owner.
        mgr.remove("c-old");
        assert!(mgr.is_subdomain_taken("demo"));
    }

    #[test]
    fn test_remove_conn_skips_replaced_entry() {
        let mgr = ConnectionManager::new(8);
        let old = conn("c1", "demo");
        mgr.add(old.clone()).unwrap();
        // A reconnect with the same client id replaces the entry.
        let newer = conn("c1", "demo");
        mgr.add(newer.clone()).unwrap();
        assert!(!mgr.remove_conn(&old));
        assert!(mgr.is_subdomain_taken("demo"));
        assert!(mgr.remove_conn(&newer));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_close_all() {
        let mgr = ConnectionManager::new(8);
        let a = conn("c1", "a");
        let b = conn("c2", "b");
        mgr.add(a.clone()).unwrap();
        mgr.add(b.clone()).unwrap();
        mgr.close_all();
        assert!(a.is_closed() && b.is_closed());
        assert!(mgr.is_empty());
    }
}
