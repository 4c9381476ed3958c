use crate::proxy::{full_body, pages, BoxBody};
use crate::registry::TunnelRecord;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Marker header that suppresses re-forwarding on the receiving peer.
pub const PROXY_MARKER_HEADER: &str = "x-tungo-proxy";
pub const ORIGINAL_HOST_HEADER: &str = "x-original-host";
pub const PROXIED_BY_HEADER: &str = "x-tungo-proxied-by";

const PEER_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_PER_HOST: usize = 20;

/// Forwards public requests to the server owning the tunnel.
///
/// Plain HTTP to the owner's public proxy port over a pooled client; the
/// marker header breaks forwarding loops on the far side.
#[derive(Clone)]
pub struct PeerProxy {
    client: Client<HttpConnector, BoxBody>,
    timeout: Duration,
}

impl PeerProxy {
    pub fn new(pool_idle_timeout: Duration) -> Self {
        Self::with_timeout(pool_idle_timeout, PEER_TIMEOUT)
    }

    fn with_timeout(pool_idle_timeout: Duration, timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_connect_timeout(Some(Duration::from_secs(5)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(POOL_IDLE_PER_HOST)
            .build(http);

        Self { client, timeout }
    }

    /// True when the request already crossed one peer hop.
    pub fn is_forwarded(headers: &http::HeaderMap) -> bool {
        headers.contains_key(PROXY_MARKER_HEADER)
    }

    /// Forward a public request to the owning server and relay its response,
    /// tagged with the owner's id. Transport failures map to 502.
    pub async fn forward(
        &self,
        req: Request<BoxBody>,
        owner: &TunnelRecord,
        public_host: &str,
        remote_addr: SocketAddr,
    ) -> Response<BoxBody> {
        let start = Instant::now();

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        let uri = format!(
            "http://{}:{}{}",
            owner.server_host, owner.proxy_port, path_and_query
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
        for (name, value) in &parts.headers {
            if name == HOST {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder
            .header(
                HeaderName::from_static("x-forwarded-for"),
                remote_addr.ip().to_string(),
            )
            .header(HeaderName::from_static(ORIGINAL_HOST_HEADER), public_host)
            .header(HeaderName::from_static(PROXY_MARKER_HEADER), "true");

        let peer_req = match builder.body(body) {
            Ok(r) => r,
            Err(e) => {
                warn!("peer: failed to build forwarded request, error={}", e);
                return self.failure(start, pages::bad_gateway("Peer request could not be built."));
            }
        };

        debug!(
            "peer: forwarding, subdomain={}, owner={}, uri={}",
            owner.subdomain, owner.server_id, uri
        );

        let result = tokio::time::timeout(self.timeout, self.client.request(peer_req)).await;
        let peer_resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(
                    "peer: forward failed, owner={}, uri={}, error={}",
                    owner.server_id, uri, e
                );
                return self.failure(start, pages::bad_gateway("The owning server is unreachable."));
            }
            Err(_) => {
                warn!("peer: forward timed out, owner={}, uri={}", owner.server_id, uri);
                return self.failure(start, pages::bad_gateway("The owning server did not answer."));
            }
        };

        let status = peer_resp.status();
        self.observe(start, status);

        let (parts, body) = peer_resp.into_parts();
        let mut builder = Response::builder().status(parts.status);
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }
        if let Ok(v) = HeaderValue::from_str(&owner.server_id) {
            builder = builder.header(HeaderName::from_static(PROXIED_BY_HEADER), v);
        }
        builder
            .body(body.boxed())
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(full_body(Bytes::from(pages::bad_gateway(
                        "Peer response could not be relayed.",
                    ))))
                    .unwrap()
            })
    }

    fn observe(&self, start: Instant, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "tungo_proxy_requests_total",
            "status" => buf.format(status.as_u16()).to_owned(),
        )
        .increment(1);
        metrics::histogram!("tungo_proxy_latency_seconds").record(start.elapsed().as_secs_f64());
    }

    fn failure(&self, start: Instant, page: String) -> Response<BoxBody> {
        self.observe(start, StatusCode::BAD_GATEWAY);
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header("content-type", "text/html; charset=utf-8")
            .body(full_body(page))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::now_unix;
    use http::HeaderMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn owner_record(port: u16) -> TunnelRecord {
        TunnelRecord {
            subdomain: "demo".into(),
            server_id: "s1".into(),
            server_host: "127.0.0.1".into(),
            client_id: "c1".into(),
            created_at: now_unix(),
            last_seen_at: now_unix(),
            proxy_port: port,
            control_port: 5555,
            password_hash: None,
        }
    }

    fn public_request(path: &str) -> Request<BoxBody> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(HOST, "demo.localhost")
            .header("x-custom", "kept")
            .body(full_body(""))
            .unwrap()
    }

    fn remote() -> SocketAddr {
        "9.8.7.6:54321".parse().unwrap()
    }

    /// Fake owner server: captures the raw request head, then either answers
    /// with a fixed 200 or holds the socket open without responding.
    async fn spawn_owner(respond: bool) -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = head_tx.send(String::from_utf8_lossy(&head).to_string());

            if respond {
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nX-Owner-Mark: yes\r\n\r\npong",
                    )
                    .await;
                let _ = socket.shutdown().await;
            } else {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        (port, head_rx)
    }

    #[test]
    fn test_is_forwarded_detects_marker() {
        let mut headers = HeaderMap::new();
        assert!(!PeerProxy::is_forwarded(&headers));
        headers.insert(PROXY_MARKER_HEADER, HeaderValue::from_static("true"));
        assert!(PeerProxy::is_forwarded(&headers));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forward_injects_headers_and_tags_response() {
        let (port, head_rx) = spawn_owner(true).await;
        let proxy = PeerProxy::new(Duration::from_secs(5));

        let resp = proxy
            .forward(
                public_request("/api?q=1"),
                &owner_record(port),
                "demo.localhost",
                remote(),
            )
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(PROXIED_BY_HEADER).unwrap(),
            "s1",
            "response must carry the owning server id"
        );
        assert_eq!(resp.headers().get("x-owner-mark").unwrap(), "yes");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");

        let head = head_rx.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api?q=1 http/1.1\r\n"), "{}", head);
        assert!(head.contains("x-tungo-proxy: true"), "{}", head);
        assert!(head.contains("x-original-host: demo.localhost"), "{}", head);
        assert!(head.contains("x-forwarded-for: 9.8.7.6"), "{}", head);
        assert!(head.contains("x-custom: kept"), "{}", head);
        // The public Host is carried in x-original-host, never as Host.
        assert!(!head.contains("host: demo.localhost"), "{}", head);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forward_unreachable_owner_is_502() {
        // Grab a free port and release it so the connect is refused.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let proxy = PeerProxy::new(Duration::from_secs(5));

        let resp = proxy
            .forward(public_request("/"), &owner_record(port), "demo.localhost", remote())
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("unreachable"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forward_timeout_is_502() {
        let (port, _head_rx) = spawn_owner(false).await;
        let proxy = PeerProxy::with_timeout(Duration::from_secs(5), Duration::from_millis(100));

        let started = Instant::now();
        let resp = proxy
            .forward(public_request("/"), &owner_record(port), "demo.localhost", remote())
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(4));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("did not answer"));
    }
}
