use crate::registry::types::TunnelRecord;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default freshness window for cached tunnel lookups.
pub const CACHE_TTL: Duration = Duration::from_secs(2);

struct CacheEntry {
    record: TunnelRecord,
    expires_at: Instant,
}

/// Hot-path lookup cache in front of the shared store.
///
/// Advisory only: a hit is served as-is, a miss falls through to the store,
/// and there is no negative caching. Invalidation is eager: every local
/// mutation and every pub/sub message drops the entry.
pub struct RegistryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl RegistryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<TunnelRecord> {
        if let Some(entry) = self.entries.get(subdomain) {
            if entry.expires_at > Instant::now() {
                metrics::counter!("tungo_cache_hits_total").increment(1);
                return Some(entry.record.clone());
            }
            drop(entry);
            self.entries.remove(subdomain);
        }
        metrics::counter!("tungo_cache_misses_total").increment(1);
        None
    }

    pub fn insert(&self, record: TunnelRecord) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .insert(record.subdomain.clone(), CacheEntry { record, expires_at });
    }

    pub fn invalidate(&self, subdomain: &str) {
        self.entries.remove(subdomain);
    }

    /// Janitor pass: drop every expired entry. Called on a 5 s interval.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::now_unix;

    fn record(sub: &str) -> TunnelRecord {
        TunnelRecord {
            subdomain: sub.into(),
            server_id: "s1".into(),
            server_host: "h".into(),
            client_id: "c".into(),
            created_at: now_unix(),
            last_seen_at: now_unix(),
            proxy_port: 8080,
            control_port: 5555,
            password_hash: None,
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = RegistryCache::new(Duration::from_secs(2));
        cache.insert(record("demo"));
        assert!(cache.get("demo").is_some());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = RegistryCache::new(Duration::from_millis(0));
        cache.insert(record("demo"));
        assert!(cache.get("demo").is_none());
        // The expired entry was removed on lookup.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_drops_entry() {
        let cache = RegistryCache::new(Duration::from_secs(2));
        cache.insert(record("demo"));
        cache.invalidate("demo");
        assert!(cache.get("demo").is_none());
    }

    #[test]
    fn test_evict_expired_only_removes_stale() {
        let cache = RegistryCache::new(Duration::from_secs(60));
        cache.insert(record("fresh"));
        cache.entries.insert(
            "stale".into(),
            CacheEntry {
                record: record("stale"),
                expires_at: Instant::now()
                    .checked_sub(Duration::from_secs(1))
                    .unwrap_or_else(Instant::now),
            },
        );
        cache.evict_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("fresh").is_some());
    }
}
