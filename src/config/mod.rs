pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ServerConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. A missing file means built-in defaults, so a
    /// server starts with zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ServerConfig = load_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        override_string("TUNGO_ID", &mut self.id);
        override_string("TUNGO_HOST", &mut self.host);
        override_parse("TUNGO_PORT", &mut self.port);
        override_parse("TUNGO_CONTROL_PORT", &mut self.control_port);
        override_parse("TUNGO_ADMIN_PORT", &mut self.admin_port);
        override_parse("TUNGO_MAX_CONNECTIONS", &mut self.max_connections);
        override_string("TUNGO_DOMAIN", &mut self.domain);
        override_string("TUNGO_PUBLIC_URL", &mut self.public_url);
        override_parse("TUNGO_READ_TIMEOUT", &mut self.read_timeout_secs);
        override_parse("TUNGO_WRITE_TIMEOUT", &mut self.write_timeout_secs);
        override_parse("TUNGO_IDLE_TIMEOUT", &mut self.idle_timeout_secs);
        override_string("TUNGO_REDIS_URL", &mut self.redis_url);
        override_bool("TUNGO_REDIS_REQUIRED", &mut self.redis_required);
        override_bool("TUNGO_REQUIRE_AUTH", &mut self.require_auth);
        override_bool("TUNGO_ALLOW_ANONYMOUS", &mut self.allow_anonymous);
        override_string("TUNGO_LOG_LEVEL", &mut self.log_level);
        override_string("TUNGO_LOG_FORMAT", &mut self.log_format);
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("server id cannot be empty");
        }
        if !self.domain.contains("{{ .subdomain }}") {
            anyhow::bail!(
                "domain template must contain a {{{{ .subdomain }}}} placeholder, got {}",
                self.domain
            );
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be positive");
        }
        if self.port == self.control_port {
            anyhow::bail!("proxy port and control port must differ");
        }
        Ok(())
    }

    /// Render the public hostname for a subdomain from the domain template.
    pub fn render_domain(&self, sub_domain: &str) -> String {
        self.domain.replace("{{ .subdomain }}", sub_domain)
    }

    /// Render the public URL for a subdomain from the URL template.
    pub fn render_public_url(&self, sub_domain: &str) -> String {
        self.public_url
            .replace("{{ .domain }}", &self.render_domain(sub_domain))
            .replace("{{ .port }}", itoa::Buffer::new().format(self.port))
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ClientConfig = load_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        override_string("TUNGO_SERVER_URL", &mut self.server_url);
        override_string("TUNGO_LOCAL_HOST", &mut self.local_host);
        override_parse("TUNGO_LOCAL_PORT", &mut self.local_port);
        override_opt_string("TUNGO_SUBDOMAIN", &mut self.subdomain);
        override_opt_string("TUNGO_SECRET_KEY", &mut self.secret_key);
        override_opt_string("TUNGO_PASSWORD", &mut self.password);
        override_opt_string("TUNGO_RECONNECT_TOKEN", &mut self.reconnect_token);
        override_parse("TUNGO_CONNECT_TIMEOUT", &mut self.connect_timeout_secs);
        override_parse("TUNGO_RETRY_INTERVAL", &mut self.retry_interval_secs);
        override_parse("TUNGO_MAX_RETRIES", &mut self.max_retries);
        override_bool("TUNGO_INSECURE_TLS", &mut self.insecure_tls);
        override_string("TUNGO_LOG_LEVEL", &mut self.log_level);
        override_string("TUNGO_LOG_FORMAT", &mut self.log_format);
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            anyhow::bail!("local_port must be positive");
        }
        for member in &self.server_cluster {
            if member.host.is_empty() {
                anyhow::bail!("cluster member host cannot be empty");
            }
        }
        if let Some(sub) = &self.subdomain {
            if !crate::server::control::is_valid_subdomain(sub) {
                anyhow::bail!("requested subdomain {:?} is not valid", sub);
            }
        }
        Ok(())
    }
}

fn load_file<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        tracing::info!("config: file not found at {}, using defaults", path.display());
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str(&content)?),
        Some("json") => Ok(serde_json::from_str(&content)?),
        Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
        None => anyhow::bail!("config file has no extension, use .toml or .json"),
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(v) = std::env::var(var) {
        *target = v;
    }
}

fn override_opt_string(var: &str, target: &mut Option<String>) {
    if let Ok(v) = std::env::var(var) {
        *target = if v.is_empty() { None } else { Some(v) };
    }
}

fn override_bool(var: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(var) {
        *target = v == "true" || v == "1";
    }
}

fn override_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}
