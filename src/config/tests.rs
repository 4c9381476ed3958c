use super::*;
use std::path::Path;

#[test]
fn test_defaults_without_file() {
    // Only fields test_env_overrides never touches, so parallel runs are safe.
    let cfg = ServerConfig::load(Path::new("/nonexistent/tungo.toml")).unwrap();
    assert_eq!(cfg.control_port, 5555);
    assert_eq!(cfg.admin_port, 9090);
    assert!(cfg.allow_anonymous);
    assert!(cfg.domain.contains("{{ .subdomain }}"));
}

#[test]
fn test_load_repo_server_config() {
    let cfg = ServerConfig::load(Path::new("tungo-server.toml")).unwrap();
    assert_eq!(cfg.id, "s1");
    assert_eq!(cfg.control_port, 5555);
    assert_eq!(cfg.read_timeout_secs, 30);
}

#[test]
fn test_load_repo_client_config() {
    let cfg = ClientConfig::load(Path::new("tungo-client.toml")).unwrap();
    assert_eq!(cfg.local_port, 3000);
    assert_eq!(cfg.cluster()[0].port, 5555);
}

#[test]
fn test_load_json_server_config() {
    let json = r#"{
        "id": "s1",
        "host": "10.0.0.5",
        "port": 8080,
        "control_port": 5555,
        "domain": "{{ .subdomain }}.tunnel.dev",
        "redis_url": "redis://127.0.0.1:6379",
        "require_auth": true
    }"#;
    let tmp = std::env::temp_dir().join("tungo_test_server.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = ServerConfig::load(&tmp).unwrap();
    assert_eq!(cfg.id, "s1");
    assert_eq!(cfg.host, "10.0.0.5");
    assert!(cfg.require_auth);
    assert_eq!(cfg.render_domain("demo"), "demo.tunnel.dev");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_toml_client_config() {
    let toml = r#"
        local_port = 3000
        subdomain = "demo"

        [[server_cluster]]
        host = "t1.example.com"
        port = 5555

        [[server_cluster]]
        host = "t2.example.com"
        port = 5555
        secure = true
    "#;
    let tmp = std::env::temp_dir().join("tungo_test_client.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = ClientConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server_cluster.len(), 2);
    assert!(cfg.server_cluster[1].secure);
    assert_eq!(cfg.subdomain.as_deref(), Some("demo"));
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_domain_template_required() {
    let cfg = ServerConfig {
        domain: "tunnel.dev".into(),
        ..ServerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_port_collision_fails() {
    let cfg = ServerConfig {
        port: 5555,
        control_port: 5555,
        ..ServerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bad_subdomain_fails() {
    let cfg = ClientConfig {
        subdomain: Some("-bad-".into()),
        ..ClientConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_render_public_url() {
    let cfg = ServerConfig {
        domain: "{{ .subdomain }}.localhost".into(),
        public_url: "http://{{ .domain }}:{{ .port }}".into(),
        port: 8080,
        ..ServerConfig::default()
    };
    assert_eq!(cfg.render_public_url("abc"), "http://abc.localhost:8080");
}

#[test]
fn test_cluster_from_server_url() {
    let cfg = ClientConfig {
        server_url: "wss://tunnel.example.com:9443".into(),
        ..ClientConfig::default()
    };
    let members = cfg.cluster();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].host, "tunnel.example.com");
    assert_eq!(members[0].port, 9443);
    assert!(members[0].secure);
}

#[test]
fn test_cluster_list_wins_over_url() {
    let cfg = ClientConfig {
        server_url: "ws://ignored:1".into(),
        server_cluster: vec![ClusterMember {
            host: "a".into(),
            port: 2,
            secure: false,
        }],
        ..ClientConfig::default()
    };
    assert_eq!(cfg.cluster()[0].host, "a");
}

#[test]
fn test_env_overrides() {
    // Env mutation: keep every env-dependent assertion in this one test so
    // parallel tests never race on the variables.
    std::env::set_var("TUNGO_PORT", "18080");
    std::env::set_var("TUNGO_REDIS_URL", "redis://env:6379");
    std::env::set_var("TUNGO_REQUIRE_AUTH", "1");
    let cfg = ServerConfig::load(Path::new("/nonexistent/tungo.toml")).unwrap();
    std::env::remove_var("TUNGO_PORT");
    std::env::remove_var("TUNGO_REDIS_URL");
    std::env::remove_var("TUNGO_REQUIRE_AUTH");
    assert_eq!(cfg.port, 18080);
    assert_eq!(cfg.redis_url, "redis://env:6379");
    assert!(cfg.require_auth);
}
