use crate::error::TunnelError;
use crate::registry::cache::{RegistryCache, CACHE_TTL};
use crate::registry::types::{
    now_unix, ServerRecord, TunnelRecord, SERVER_TTL_SECS, TUNNEL_TTL_SECS,
};
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const TUNNEL_KEY_PREFIX: &str = "tunnel:";
const SERVER_KEY_PREFIX: &str = "server:";

/// Pub/sub channel carrying `"{action}:{subdomain}"` invalidations,
/// `action ∈ {register, unregister}`.
pub const UPDATES_CHANNEL: &str = "tunnel:updates";

/// Cluster tunnel directory over a shared redis store.
///
/// Records are JSON values under per-key TTLs; a local [`RegistryCache`]
/// absorbs hot-path lookups and is invalidated over [`UPDATES_CHANNEL`].
/// All operations are single-shot; reconnect and interval loops are owned
/// by bootstrap.
pub struct RedisRegistry {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
    server_id: String,
    cache: RegistryCache,
}

fn tunnel_key(subdomain: &str) -> String {
    format!("{}{}", TUNNEL_KEY_PREFIX, subdomain)
}

fn server_key(server_id: &str) -> String {
    format!("{}{}", SERVER_KEY_PREFIX, server_id)
}

/// Record one shared-store operation in the `tungo_redis_*` series.
fn observe(operation: &'static str, start: Instant, ok: bool) {
    metrics::counter!(
        "tungo_redis_operations_total",
        "operation" => operation,
        "status" => if ok { "success" } else { "error" },
    )
    .increment(1);
    metrics::histogram!("tungo_redis_latency_seconds").record(start.elapsed().as_secs_f64());
}

impl RedisRegistry {
    pub async fn connect(url: &str, server_id: String) -> Result<Self, TunnelError> {
        let client = redis::Client::open(url)
            .map_err(|e| TunnelError::RegistryUnavailable(e.to_string()))?;
        let mut conn = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| TunnelError::RegistryUnavailable(e.to_string()))?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TunnelError::RegistryUnavailable(e.to_string()))?;
        info!("registry: redis connected, url={}", url);
        Ok(Self {
            client,
            conn,
            server_id,
            cache: RegistryCache::new(CACHE_TTL),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn cache(&self) -> &RegistryCache {
        &self.cache
    }

    // ---- Tunnels ----

    pub async fn register_tunnel(&self, mut record: TunnelRecord) -> Result<(), TunnelError> {
        record.server_id = self.server_id.clone();
        record.last_seen_at = now_unix();
        if record.created_at == 0 {
            record.created_at = match self.fetch_tunnel(&record.subdomain).await {
                Ok(Some(existing)) if existing.created_at != 0 => existing.created_at,
                _ => now_unix(),
            };
        }

        self.put_tunnel(&record, "register_tunnel").await?;
        self.cache.insert(record.clone());
        self.publish_update("register", &record.subdomain).await;
        debug!(
            "registry: tunnel registered, subdomain={}, server_id={}",
            record.subdomain, record.server_id
        );
        Ok(())
    }

    pub async fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, TunnelError> {
        if let Some(record) = self.cache.get(subdomain) {
            return Ok(record);
        }
        let record = self
            .fetch_tunnel(subdomain)
            .await?
            .ok_or(TunnelError::NotFound)?;
        if record.is_expired(now_unix()) {
            return Err(TunnelError::Expired);
        }
        self.cache.insert(record.clone());
        Ok(record)
    }

    pub async fn unregister_tunnel(&self, subdomain: &str) -> Result<(), TunnelError> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.del(tunnel_key(subdomain)).await;
        observe("unregister_tunnel", start, result.is_ok());
        result?;
        self.cache.invalidate(subdomain);
        self.publish_update("unregister", subdomain).await;
        debug!("registry: tunnel unregistered, subdomain={}", subdomain);
        Ok(())
    }

    /// Rewrites the whole record with a fresh `last_seen_at` and a fresh key
    /// TTL, so a live owner's tunnels never lapse.
    pub async fn refresh_tunnel(&self, subdomain: &str) -> Result<(), TunnelError> {
        let mut record = self
            .fetch_tunnel(subdomain)
            .await?
            .ok_or(TunnelError::NotFound)?;
        record.last_seen_at = now_unix();
        self.put_tunnel(&record, "refresh_tunnel").await?;
        self.cache.insert(record);
        Ok(())
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, TunnelError> {
        let payloads = self.scan_values(TUNNEL_KEY_PREFIX, "list_tunnels").await?;
        let now = now_unix();
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str::<TunnelRecord>(p).ok())
            .filter(|r| !r.is_expired(now))
            .collect())
    }

    pub async fn is_local(&self, subdomain: &str) -> bool {
        matches!(self.get_tunnel(subdomain).await, Ok(record) if record.server_id == self.server_id)
    }

    // ---- Servers ----

    pub async fn register_server(&self, mut record: ServerRecord) -> Result<(), TunnelError> {
        record.last_heartbeat = now_unix();
        self.put_server(&record, "register_server").await
    }

    pub async fn get_server(&self, server_id: &str) -> Result<ServerRecord, TunnelError> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = conn.get(server_key(server_id)).await;
        observe("get_server", start, result.is_ok());
        let payload = result?.ok_or(TunnelError::NotFound)?;
        let record: ServerRecord = serde_json::from_str(&payload)
            .map_err(|e| TunnelError::Internal(format!("bad server record: {}", e)))?;
        if record.is_expired(now_unix()) {
            return Err(TunnelError::Expired);
        }
        Ok(record)
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerRecord>, TunnelError> {
        let payloads = self.scan_values(SERVER_KEY_PREFIX, "list_servers").await?;
        let now = now_unix();
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str::<ServerRecord>(p).ok())
            .filter(|r| !r.is_expired(now))
            .collect())
    }

    /// Least `active_connections` wins; ties break on server id so the
    /// choice is deterministic within one process.
    pub async fn pick_least_loaded_server(&self) -> Result<ServerRecord, TunnelError> {
        self.list_servers()
            .await?
            .into_iter()
            .min_by_key(|r| (r.active_connections, r.server_id.clone()))
            .ok_or(TunnelError::NotFound)
    }

    pub async fn update_server_load(
        &self,
        active_connections: u64,
        active_tunnels: u64,
    ) -> Result<(), TunnelError> {
        let mut record = self.get_server(&self.server_id).await?;
        record.active_connections = active_connections;
        record.active_tunnels = active_tunnels;
        record.last_heartbeat = now_unix();
        self.put_server(&record, "update_server_load").await
    }

    // ---- Invalidation listener ----

    /// One long-lived pub/sub session with resubscribe-on-failure. Returns
    /// only on shutdown.
    pub async fn run_invalidation_listener(&self, shutdown: Arc<Notify>) {
        loop {
            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(ps) => ps,
                Err(e) => {
                    warn!("registry: pubsub connect failed, error={}", e);
                    if sleep_or_shutdown(&shutdown).await {
                        return;
                    }
                    continue;
                }
            };
            if let Err(e) = pubsub.subscribe(UPDATES_CHANNEL).await {
                warn!("registry: pubsub subscribe failed, error={}", e);
                if sleep_or_shutdown(&shutdown).await {
                    return;
                }
                continue;
            }
            info!("registry: subscribed, channel={}", UPDATES_CHANNEL);

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(msg) => self.handle_invalidation(&msg),
                        None => {
                            warn!("registry: pubsub stream ended, resubscribing...");
                            break;
                        }
                    },
                    _ = shutdown.notified() => return,
                }
            }
            drop(stream);

            if sleep_or_shutdown(&shutdown).await {
                return;
            }
        }
    }

    fn handle_invalidation(&self, msg: &redis::Msg) {
        metrics::counter!("tungo_pubsub_messages_total").increment(1);
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("registry: unreadable pubsub payload, error={}", e);
                return;
            }
        };
        match parse_invalidation(&payload) {
            Some((action, subdomain)) => {
                self.cache.invalidate(subdomain);
                debug!(
                    "registry: cache invalidated, action={}, subdomain={}",
                    action, subdomain
                );
            }
            None => warn!("registry: unrecognized pubsub payload: {}", payload),
        }
    }

    // ---- private helpers ----

    async fn fetch_tunnel(&self, subdomain: &str) -> Result<Option<TunnelRecord>, TunnelError> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Option<String>> = conn.get(tunnel_key(subdomain)).await;
        observe("get_tunnel", start, result.is_ok());
        match result? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload).map_err(|e| {
                TunnelError::Internal(format!("bad tunnel record: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    async fn put_tunnel(
        &self,
        record: &TunnelRecord,
        operation: &'static str,
    ) -> Result<(), TunnelError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| TunnelError::Internal(format!("serialize tunnel: {}", e)))?;
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(tunnel_key(&record.subdomain), payload, TUNNEL_TTL_SECS)
            .await;
        observe(operation, start, result.is_ok());
        result.map_err(Into::into)
    }

    async fn put_server(
        &self,
        record: &ServerRecord,
        operation: &'static str,
    ) -> Result<(), TunnelError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| TunnelError::Internal(format!("serialize server: {}", e)))?;
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn
            .set_ex(server_key(&record.server_id), payload, SERVER_TTL_SECS)
            .await;
        observe(operation, start, result.is_ok());
        result.map_err(Into::into)
    }

    /// Cursor-based enumeration (`SCAN MATCH`), never `KEYS`, which would
    /// block the shared store.
    async fn scan_values(
        &self,
        prefix: &str,
        operation: &'static str,
    ) -> Result<Vec<String>, TunnelError> {
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);

        let keys: redis::RedisResult<Vec<String>> = async {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        }
        .await;
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                observe(operation, start, false);
                return Err(e.into());
            }
        };

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let payload: redis::RedisResult<Option<String>> = conn.get(&key).await;
            match payload {
                // A key can expire between SCAN and GET; skip it.
                Ok(Some(p)) => values.push(p),
                Ok(None) => {}
                Err(e) => {
                    observe(operation, start, false);
                    return Err(e.into());
                }
            }
        }
        observe(operation, start, true);
        Ok(values)
    }

    async fn publish_update(&self, action: &str, subdomain: &str) {
        let payload = format!("{}:{}", action, subdomain);
        let start = Instant::now();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.publish(UPDATES_CHANNEL, payload).await;
        observe("publish_update", start, result.is_ok());
        if let Err(e) = result {
            // Invalidation is best-effort; peers fall back to cache TTL expiry.
            warn!(
                "registry: publish failed, action={}, subdomain={}, error={}",
                action, subdomain, e
            );
        }
    }
}

async fn sleep_or_shutdown(shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => false,
        _ = shutdown.notified() => true,
    }
}

/// Split a `"{action}:{subdomain}"` invalidation payload. Only `register`
/// and `unregister` actions are honored; anything else is dropped by the
/// caller with a warning.
fn parse_invalidation(payload: &str) -> Option<(&str, &str)> {
    match payload.split_once(':') {
        Some((action, subdomain))
            if (action == "register" || action == "unregister") && !subdomain.is_empty() =>
        {
            Some((action, subdomain))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pub/sub delivery as the redis protocol frames it, without a server.
    fn pubsub_msg(payload: &str) -> redis::Msg {
        let value = redis::Value::Array(vec![
            redis::Value::BulkString(b"message".to_vec()),
            redis::Value::BulkString(UPDATES_CHANNEL.as_bytes().to_vec()),
            redis::Value::BulkString(payload.as_bytes().to_vec()),
        ]);
        redis::Msg::from_value(&value).expect("well-formed pubsub frame")
    }

    #[test]
    fn test_key_prefixes() {
        assert_eq!(tunnel_key("demo"), "tunnel:demo");
        assert_eq!(server_key("s1"), "server:s1");
        // The updates channel shares the tunnel prefix namespace.
        assert_eq!(UPDATES_CHANNEL, "tunnel:updates");
    }

    #[test]
    fn test_parse_invalidation_accepts_both_actions() {
        assert_eq!(
            parse_invalidation("register:demo"),
            Some(("register", "demo"))
        );
        assert_eq!(
            parse_invalidation("unregister:abc12xyz"),
            Some(("unregister", "abc12xyz"))
        );
    }

    #[test]
    fn test_parse_invalidation_rejects_malformed_payloads() {
        assert_eq!(parse_invalidation("refresh:demo"), None);
        assert_eq!(parse_invalidation("register"), None);
        assert_eq!(parse_invalidation("register:"), None);
        assert_eq!(parse_invalidation(""), None);
        assert_eq!(parse_invalidation("garbage"), None);
    }

    #[test]
    fn test_parse_invalidation_splits_on_first_colon_only() {
        // A colon in the remainder stays with the subdomain part; cache
        // invalidation treats it as an opaque key.
        assert_eq!(
            parse_invalidation("register:a:b"),
            Some(("register", "a:b"))
        );
    }

    #[test]
    fn test_pubsub_frame_payload_reaches_parser() {
        let msg = pubsub_msg("unregister:demo");
        assert_eq!(msg.get_channel_name(), UPDATES_CHANNEL);
        let payload: String = msg.get_payload().unwrap();
        assert_eq!(parse_invalidation(&payload), Some(("unregister", "demo")));
    }
}
