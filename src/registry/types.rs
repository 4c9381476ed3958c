use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Soft TTL on a tunnel record. The owning server refreshes well inside this
/// window (see [`HEARTBEAT_INTERVAL`]), so a live tunnel never expires.
pub const TUNNEL_TTL_SECS: u64 = 30;

/// TTL on a server descriptor.
pub const SERVER_TTL_SECS: u64 = 10;

/// Descriptor refresh and load-update cadence. Strictly below both TTLs.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A tunnel (tenant) as serialized for the cluster. The JSON field names are
/// the cross-server contract; the binary layout is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub subdomain: String,
    pub server_id: String,
    pub server_host: String,
    pub client_id: String,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub proxy_port: u16,
    pub control_port: u16,

    /// `hex(sha256(password))`. The plaintext never leaves the hello.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl TunnelRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.last_seen_at > TUNNEL_TTL_SECS as i64
    }
}

/// A cluster member as serialized for the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub host: String,
    pub proxy_port: u16,
    pub control_port: u16,
    pub last_heartbeat: i64,
    pub active_tunnels: u64,
    pub active_connections: u64,
}

impl ServerRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.last_heartbeat > SERVER_TTL_SECS as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_record_json_shape() {
        let record = TunnelRecord {
            subdomain: "demo".into(),
            server_id: "s1".into(),
            server_host: "10.0.0.5".into(),
            client_id: "c1".into(),
            created_at: 100,
            last_seen_at: 200,
            proxy_port: 8080,
            control_port: 5555,
            password_hash: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["subdomain"], "demo");
        assert_eq!(value["server_id"], "s1");
        assert_eq!(value["last_seen_at"], 200);
        // Optional field is omitted, not null.
        assert!(value.get("password_hash").is_none());
    }

    #[test]
    fn test_tunnel_expiry_window() {
        let mut record = TunnelRecord {
            subdomain: "demo".into(),
            server_id: "s1".into(),
            server_host: "h".into(),
            client_id: "c".into(),
            created_at: 0,
            last_seen_at: 1_000,
            proxy_port: 1,
            control_port: 2,
            password_hash: None,
        };
        assert!(!record.is_expired(1_000 + TUNNEL_TTL_SECS as i64));
        assert!(record.is_expired(1_001 + TUNNEL_TTL_SECS as i64));
        record.last_seen_at = 0;
        assert!(record.is_expired(now_unix()));
    }

    #[test]
    fn test_server_record_roundtrip() {
        let record = ServerRecord {
            server_id: "s2".into(),
            host: "peer".into(),
            proxy_port: 8081,
            control_port: 5556,
            last_heartbeat: now_unix(),
            active_tunnels: 3,
            active_connections: 7,
        };
        let text = serde_json::to_string(&record).unwrap();
        let back: ServerRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.server_id, "s2");
        assert_eq!(back.active_connections, 7);
        assert!(!back.is_expired(now_unix()));
    }
}
