use super::ServerState;
use crate::proxy::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Admin surface: health, readiness, Prometheus metrics, and directory
/// introspection.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: ServerState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => Ok(Response::builder()
            .status(200)
            .body(full_body(format!(
                r#"{{"status":"ready","server_id":"{}","active_tunnels":{}}}"#,
                state.config.id,
                state.connections.len(),
            )))
            .unwrap()),

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/tunnels" => {
            let tunnels = state.registry.list_tunnels().await.unwrap_or_default();
            let tunnels: Vec<serde_json::Value> = tunnels
                .iter()
                .map(|t| {
                    let traffic = state
                        .connections
                        .get_by_subdomain(&t.subdomain)
                        .map(|conn| {
                            conn.snapshot_traffic()
                        });
                    serde_json::json!({
                        "subdomain": t.subdomain,
                        "server_id": t.server_id,
                        "client_id": t.client_id,
                        "created_at": t.created_at,
                        "last_seen_at": t.last_seen_at,
                        "public_host": state.config.render_domain(&t.subdomain),
                        "protected": t.password_hash.is_some(),
                        "streams": traffic.as_ref().map(|s| s.streams),
                        "request_bytes": traffic.as_ref().map(|s| s.request_bytes),
                        "response_bytes": traffic.as_ref().map(|s| s.response_bytes),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&tunnels).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/servers" => {
            let servers = state.registry.list_servers().await.unwrap_or_default();
            let least_loaded = state
                .registry
                .pick_least_loaded_server()
                .await
                .ok()
                .map(|s| s.server_id);
            let body = serde_json::to_string_pretty(&serde_json::json!({
                "servers": servers,
                "least_loaded": least_loaded,
            }))
            .unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
