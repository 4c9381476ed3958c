use serde::{Deserialize, Serialize};

/// Server-side configuration. Loaded from a TOML/JSON file, then overridden
/// by `TUNGO_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Cluster-unique server id. Defaults to the machine hostname.
    #[serde(default = "default_server_id")]
    pub id: String,

    /// Address peers and clients use to reach this server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Public proxy port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Control (WebSocket) port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Admin/metrics port.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Hostname template with a `{{ .subdomain }}` placeholder, e.g.
    /// `{{ .subdomain }}.tunnel.example.com`.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Public URL template over `{{ .domain }}` and `{{ .port }}`.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default = "default_read_timeout", alias = "read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout", alias = "write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_idle_timeout", alias = "idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Empty selects the in-memory registry; anything else is dialed as a
    /// redis URL and selects the distributed registry.
    #[serde(default)]
    pub redis_url: String,

    /// When true, an unreachable redis at startup is fatal. When false the
    /// server falls back to the in-memory registry and keeps running.
    #[serde(default)]
    pub redis_required: bool,

    #[serde(default)]
    pub require_auth: bool,

    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `json` or `plain`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: default_server_id(),
            host: default_host(),
            port: default_port(),
            control_port: default_control_port(),
            admin_port: default_admin_port(),
            max_connections: default_max_connections(),
            domain: default_domain(),
            public_url: default_public_url(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            redis_url: String::new(),
            redis_required: false,
            require_auth: false,
            allow_anonymous: true,
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "tungo".to_string())
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    5555
}

fn default_admin_port() -> u16 {
    9090
}

fn default_max_connections() -> usize {
    1024
}

fn default_domain() -> String {
    "{{ .subdomain }}.localhost".to_string()
}

fn default_public_url() -> String {
    "http://{{ .domain }}:{{ .port }}".to_string()
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "plain".to_string()
}

/// One reachable server in the cluster, from the client's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

/// Client-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Single-server shorthand, e.g. `ws://tunnel.example.com:5555`.
    /// Parsed into a one-entry cluster when `server_cluster` is empty.
    #[serde(default)]
    pub server_url: String,

    #[serde(default)]
    pub server_cluster: Vec<ClusterMember>,

    #[serde(default = "default_local_host")]
    pub local_host: String,

    #[serde(default = "default_local_port")]
    pub local_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<String>,

    #[serde(default = "default_connect_timeout", alias = "connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retry_interval", alias = "retry_interval")]
    pub retry_interval_secs: u64,

    /// Consecutive failures on one member before rotating to the next.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Skip TLS certificate verification on secure members.
    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            server_cluster: Vec::new(),
            local_host: default_local_host(),
            local_port: default_local_port(),
            subdomain: None,
            secret_key: None,
            password: None,
            reconnect_token: None,
            connect_timeout_secs: default_connect_timeout(),
            retry_interval_secs: default_retry_interval(),
            max_retries: default_max_retries(),
            insecure_tls: false,
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    3000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

impl ClientConfig {
    /// Resolve the effective cluster member list. `server_cluster` wins;
    /// otherwise `server_url` is parsed as `ws://host:port` / `wss://host:port`.
    pub fn cluster(&self) -> Vec<ClusterMember> {
        if !self.server_cluster.is_empty() {
            return self.server_cluster.clone();
        }
        if self.server_url.is_empty() {
            return vec![ClusterMember {
                host: "127.0.0.1".to_string(),
                port: 5555,
                secure: false,
            }];
        }
        let (secure, rest) = match self.server_url.strip_prefix("wss://") {
            Some(rest) => (true, rest),
            None => (
                false,
                self.server_url
                    .strip_prefix("ws://")
                    .unwrap_or(&self.server_url),
            ),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(5555)),
            None => (rest.to_string(), if secure { 443 } else { 5555 }),
        };
        vec![ClusterMember { host, port, secure }]
    }
}
