use crate::conn::ControlConnection;
use crate::error::TunnelError;
use crate::proxy::http_codec::{self, ResponseParse};
use crate::proxy::peer::PeerProxy;
use crate::proxy::{auth, full_body, pages, BoxBody};
use crate::protocol::{Envelope, PROTOCOL_HTTP};
use crate::registry::TunnelRecord;
use crate::server::ServerState;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, SET_COOKIE};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// First-chunk window: how long the origin gets to produce its first byte.
const FIRST_CHUNK_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);
/// Progress condition between chunks; expiry finalizes the response.
const IDLE_WINDOW: std::time::Duration = std::time::Duration::from_millis(200);
/// Wall-clock budget for the whole exchange.
const HARD_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Advisory wait for the init frame to flush: 50 polls of 10 ms.
const INIT_ACK_POLLS: u32 = 50;
const INIT_ACK_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Handle one public HTTP request through a phased lifecycle:
///
/// 1. EXTRACT  — subdomain from the Host header
/// 2. RESOLVE  — registry, peer handoff, or local connection manager
/// 3. AUTH     — tenant password (header or cookie)
/// 4. STREAM   — allocate stream, emit init + request bytes
/// 5. COLLECT  — accumulate response chunks under the timeout ladder
/// 6. RESPOND  — parse and relay status/headers/body
pub async fn handle_public_request(
    req: Request<Incoming>,
    state: ServerState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let ctx = RouterContext::new(&req);

    let Some(sub_domain) = state.domain.extract(&ctx.host) else {
        debug!("router: host did not match domain template, host={}", ctx.host);
        return Ok(ctx.page(StatusCode::NOT_FOUND, pages::not_found(&ctx.host), ""));
    };

    let conn = match resolve(&req, &state, &sub_domain).await {
        Resolution::Local(conn) => conn,
        Resolution::Remote(record) => {
            let resp = state
                .peer
                .forward(req.map(|b| b.boxed()), &record, &ctx.host, peer_addr)
                .await;
            ctx.finish(&sub_domain, resp.status());
            return Ok(resp);
        }
        Resolution::Absent => {
            return Ok(ctx.page(
                StatusCode::SERVICE_UNAVAILABLE,
                pages::tunnel_offline(&sub_domain),
                &sub_domain,
            ));
        }
    };

    // Tenant password enforcement.
    match auth::check(req.headers(), &sub_domain, conn.password_hash.as_deref()) {
        auth::AuthDecision::Allowed => {}
        auth::AuthDecision::GrantCookie => {
            let hash = conn.password_hash.clone().unwrap_or_default();
            let resp = Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .header(
                    SET_COOKIE,
                    HeaderValue::from_str(&auth::grant_cookie(&sub_domain, &hash))
                        .unwrap_or(HeaderValue::from_static("")),
                )
                .body(full_body(r#"{"authenticated": true}"#))
                .unwrap();
            ctx.finish(&sub_domain, StatusCode::OK);
            return Ok(resp);
        }
        auth::AuthDecision::BadPassword => {
            ctx.finish(&sub_domain, StatusCode::UNAUTHORIZED);
            return Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("content-type", "application/json")
                .body(full_body(r#"{"error":"password invalid"}"#))
                .unwrap());
        }
        auth::AuthDecision::PromptRequired => {
            ctx.finish(&sub_domain, StatusCode::UNAUTHORIZED);
            return Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("content-type", "text/html; charset=utf-8")
                .body(full_body(pages::password_prompt(&sub_domain)))
                .unwrap());
        }
    }

    // STREAM phase. The guard removes the stream on every exit path.
    let stream_id = uuid::Uuid::new_v4().to_string();
    let (stream, mut inbound_rx) =
        conn.add_stream(&stream_id, PROTOCOL_HTTP, &peer_addr.to_string());
    let _guard = StreamGuard {
        conn: conn.clone(),
        stream_id: stream_id.clone(),
    };

    if let Err(e) = conn.send(Envelope::init(&stream_id, PROTOCOL_HTTP)) {
        warn!(
            "router: init send failed, subdomain={}, stream_id={}, error={}",
            sub_domain, stream_id, e
        );
        return Ok(ctx.page(
            StatusCode::BAD_GATEWAY,
            pages::bad_gateway("The tunnel is not accepting new streams."),
            &sub_domain,
        ));
    }

    // Advisory: give the write pump a moment to flush the init frame so the
    // client can open its local connection before request bytes land.
    for _ in 0..INIT_ACK_POLLS {
        if conn.outbound_drained() || conn.is_closed() {
            break;
        }
        tokio::time::sleep(INIT_ACK_POLL_INTERVAL).await;
    }

    // Marshal the request as canonical HTTP/1.1 bytes.
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let body_bytes = body.collect().await?.to_bytes();
    let raw_request =
        http_codec::serialize_request(&parts.method, &path_and_query, &parts.headers, &body_bytes);
    stream.record_request(&raw_request);

    if let Err(e) = conn.send(Envelope::data(&stream_id, &raw_request)) {
        warn!(
            "router: request send failed, subdomain={}, stream_id={}, error={}",
            sub_domain, stream_id, e
        );
        let reason = match e {
            TunnelError::SendBufferFull => "The tunnel's send queue is full.",
            _ => "The tunnel closed while sending the request.",
        };
        return Ok(ctx.page(StatusCode::BAD_GATEWAY, pages::bad_gateway(reason), &sub_domain));
    }

    // COLLECT phase.
    let collected = collect_response(&stream, &mut inbound_rx).await;
    let buffer = match collected {
        Collected::TimedOut => {
            warn!(
                "router: hard deadline exceeded, subdomain={}, stream_id={}",
                sub_domain, stream_id
            );
            return Ok(ctx.page(
                StatusCode::GATEWAY_TIMEOUT,
                pages::gateway_timeout(),
                &sub_domain,
            ));
        }
        Collected::Empty => {
            return Ok(ctx.page(
                StatusCode::BAD_GATEWAY,
                pages::bad_gateway("The tunnel closed without sending a response."),
                &sub_domain,
            ));
        }
        Collected::Bytes(buffer) => buffer,
    };

    // RESPOND phase.
    let mut resp = match http_codec::parse_response(&buffer) {
        ResponseParse::Parsed(parsed) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(parsed.status).unwrap_or(StatusCode::OK));
            for (name, value) in &parsed.headers {
                if is_transport_header(name) {
                    continue;
                }
                if let (Ok(n), Ok(v)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_bytes(value),
                ) {
                    builder = builder.header(n, v);
                }
            }
            builder.body(full_body(parsed.body)).unwrap()
        }
        ResponseParse::Opaque(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(bytes))
            .unwrap(),
        ResponseParse::Malformed => {
            return Ok(ctx.page(
                StatusCode::BAD_GATEWAY,
                pages::bad_gateway("The tunneled origin sent an unreadable response."),
                &sub_domain,
            ));
        }
    };

    append_diagnostics(resp.headers_mut(), &conn, &stream_id, &sub_domain);
    ctx.finish(&sub_domain, resp.status());
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Resolution — registry first, peer handoff for remote owners, connection
// manager as the authoritative local fallback.
// ---------------------------------------------------------------------------

enum Resolution {
    Local(Arc<ControlConnection>),
    Remote(TunnelRecord),
    Absent,
}

async fn resolve(req: &Request<Incoming>, state: &ServerState, sub_domain: &str) -> Resolution {
    // A request that already crossed a peer hop must resolve locally only.
    let forwarded = PeerProxy::is_forwarded(req.headers());

    match state.registry.get_tunnel(sub_domain).await {
        Ok(record) if record.server_id == state.registry.server_id() => {
            // Registry says local; the connection manager has the live handle.
        }
        Ok(record) => {
            if !forwarded {
                return Resolution::Remote(record);
            }
            debug!(
                "router: proxy marker present, resolving locally, subdomain={}",
                sub_domain
            );
        }
        Err(TunnelError::NotFound) | Err(TunnelError::Expired) => {
            // Covers the in-memory variant and reconnects ahead of registry
            // propagation — the local index decides.
        }
        Err(e) => {
            warn!(
                "router: registry lookup failed, falling back to local index, subdomain={}, error={}",
                sub_domain, e
            );
        }
    }

    match state.connections.get_by_subdomain(sub_domain) {
        Some(conn) => Resolution::Local(conn),
        None => Resolution::Absent,
    }
}

// ---------------------------------------------------------------------------
// Response collection — the per-request state machine from the design:
// await first chunk → accumulate until idle or end → parse → respond.
// ---------------------------------------------------------------------------

enum Collected {
    Bytes(Vec<u8>),
    TimedOut,
    Empty,
}

async fn collect_response(
    stream: &crate::conn::TunnelStream,
    inbound_rx: &mut mpsc::Receiver<Bytes>,
) -> Collected {
    let hard_deadline = tokio::time::Instant::now() + HARD_DEADLINE;
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let window = if buffer.is_empty() {
            FIRST_CHUNK_WINDOW
        } else {
            IDLE_WINDOW
        };
        let wake = (tokio::time::Instant::now() + window).min(hard_deadline);

        tokio::select! {
            biased;

            chunk = inbound_rx.recv() => match chunk {
                Some(chunk) => {
                    stream.record_response(&chunk);
                    buffer.extend_from_slice(&chunk);
                }
                None => break,
            },

            _ = stream.closed().cancelled() => {
                // End observed (or connection died). Data frames preceding
                // the end are still queued — drain them before finalizing.
                while let Ok(chunk) = inbound_rx.try_recv() {
                    stream.record_response(&chunk);
                    buffer.extend_from_slice(&chunk);
                }
                break;
            }

            _ = tokio::time::sleep_until(wake) => {
                if tokio::time::Instant::now() >= hard_deadline {
                    return Collected::TimedOut;
                }
                // Idle (or first-chunk) window expired.
                break;
            }
        }
    }

    if buffer.is_empty() {
        Collected::Empty
    } else {
        Collected::Bytes(buffer)
    }
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

/// Removal guard: `remove_stream` runs exactly once, on success, error, and
/// timeout paths alike.
struct StreamGuard {
    conn: Arc<ControlConnection>,
    stream_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.conn.remove_stream(&self.stream_id);
    }
}

/// Headers owned by the transport on the public leg; everything else is
/// relayed verbatim.
fn is_transport_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
}

fn append_diagnostics(
    headers: &mut http::HeaderMap,
    conn: &ControlConnection,
    stream_id: &str,
    sub_domain: &str,
) {
    let mut put = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    put("x-tungo-client-id", &conn.client_id);
    put("x-tungo-stream-id", stream_id);
    put("x-tungo-subdomain", sub_domain);
    put("x-tungo-protocol", PROTOCOL_HTTP);
    if let Some(version) = &conn.client_version {
        put("x-tungo-client-version", version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::TunnelStream;

    fn stream() -> (Arc<TunnelStream>, mpsc::Receiver<Bytes>) {
        let (stream, rx) = TunnelStream::new("s-1".into(), "http".into(), "test".into());
        (Arc::new(stream), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_finalizes_on_end() {
        let (stream, mut rx) = stream();
        stream.deliver(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));
        stream.deliver(Bytes::from_static(b"hi"));
        stream.close();
        match collect_response(&stream, &mut rx).await {
            Collected::Bytes(buf) => assert_eq!(buf, b"HTTP/1.1 200 OK\r\n\r\nhi"),
            _ => panic!("expected buffered bytes"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_idle_window_finalizes_partial_response() {
        let (stream, mut rx) = stream();
        stream.deliver(Bytes::from_static(b"burst"));
        // No end, no further chunks: the 200 ms idle window closes it out.
        match collect_response(&stream, &mut rx).await {
            Collected::Bytes(buf) => assert_eq!(buf, b"burst"),
            _ => panic!("expected buffered bytes"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_empty_first_window_is_no_response() {
        let (stream, mut rx) = stream();
        assert!(matches!(
            collect_response(&stream, &mut rx).await,
            Collected::Empty
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_trickle_hits_hard_deadline() {
        let (stream, mut rx) = stream();
        let feeder = stream.clone();
        tokio::spawn(async move {
            // A chunk every 100 ms keeps the idle window from firing, so
            // only the 30 s hard deadline can end the exchange.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                if feeder.deliver(Bytes::from_static(b"x")) != crate::conn::Delivery::Accepted {
                    return;
                }
            }
        });
        assert!(matches!(
            collect_response(&stream, &mut rx).await,
            Collected::TimedOut
        ));
        stream.close();
    }
}

struct RouterContext {
    start: Instant,
    host: String,
    method: String,
    path: String,
}

impl RouterContext {
    fn new(req: &Request<Incoming>) -> Self {
        Self {
            start: Instant::now(),
            host: req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
        }
    }

    /// Styled error page plus metrics/access-log finalization.
    fn page(&self, status: StatusCode, body: String, sub_domain: &str) -> Response<BoxBody> {
        self.finish(sub_domain, status);
        let mut buf = itoa::Buffer::new();
        Response::builder()
            .status(status)
            .header("content-type", "text/html; charset=utf-8")
            .header(CONTENT_LENGTH, buf.format(body.len()))
            .body(full_body(body))
            .unwrap()
    }

    fn finish(&self, sub_domain: &str, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "tungo_http_requests_total",
            "status_code" => buf.format(status.as_u16()).to_owned(),
        )
        .increment(1);
        metrics::histogram!("tungo_http_request_duration_seconds")
            .record(self.start.elapsed().as_secs_f64());

        // Structured access log — one line per request at info level.
        tracing::info!(
            method = %self.method,
            host = %self.host,
            path = %self.path,
            subdomain = %sub_domain,
            status = status.as_u16(),
            latency_ms = %self.start.elapsed().as_millis(),
            "access"
        );
    }
}
