use crate::conn::ControlConnection;
use crate::error::TunnelError;
use crate::protocol::codec::{self, MAX_FRAME_BYTES};
use crate::protocol::{
    ClientHello, ClientType, Envelope, MessageType, ReconnectToken, ServerHello, ServerHelloType,
};
use crate::proxy::{empty_body, BoxBody};
use crate::registry::TunnelRecord;
use crate::server::ServerState;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Budget for the client to produce its hello after the transport opens.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Server heartbeat cadence on the write pump.
const HEARTBEAT_TICK: Duration = Duration::from_secs(30);

type WsWriter = SplitSink<WebSocketStream<TokioIo<Upgraded>>, Message>;
type WsReader = SplitStream<WebSocketStream<TokioIo<Upgraded>>>;

pub fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_BYTES))
        .max_frame_size(Some(MAX_FRAME_BYTES))
}

// ---------------------------------------------------------------------------
// Subdomain and identity rules
// ---------------------------------------------------------------------------

/// 1–63 chars of `[a-z0-9-]`, no leading or trailing hyphen.
pub fn is_valid_subdomain(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("subdomain regex")
    });
    re.is_match(s)
}

/// Random 8-char lowercase alphanumeric label.
pub fn generate_subdomain() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Deterministic client id for authenticated clients: `base64(sha256(key))`.
/// The same secret always lands on the same identity, which is what lets a
/// reconnecting client reclaim its own subdomain without a grace period.
pub fn derive_client_id(secret_key: &str) -> String {
    BASE64.encode(Sha256::digest(secret_key.as_bytes()))
}

// ---------------------------------------------------------------------------
// HTTP surface of the control listener
// ---------------------------------------------------------------------------

/// Control endpoint service: upgrades `/ws` to a WebSocket and hands the
/// connection to the hello/pump lifecycle. Any origin is accepted because
/// tunnels originate from arbitrary client processes.
pub async fn handle_control(
    mut req: Request<Incoming>,
    state: ServerState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    if req.uri().path() != "/ws" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "application/json")
            .body(crate::proxy::full_body(r#"{"error":"not found"}"#))
            .unwrap());
    }

    let is_upgrade = req
        .headers()
        .get(UPGRADE)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false);
    let key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|v| derive_accept_key(v.as_bytes()));
    let accept = match key {
        Some(accept) if is_upgrade => accept,
        _ => {
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(crate::proxy::full_body("expected websocket upgrade"))
                .unwrap());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws =
                    WebSocketStream::from_raw_socket(io, Role::Server, Some(ws_config())).await;
                serve_connection(ws, state, peer_addr).await;
            }
            Err(e) => warn!("control: upgrade failed, peer={}, error={}", peer_addr, e),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .unwrap())
}

// ---------------------------------------------------------------------------
// Hello handshake
// ---------------------------------------------------------------------------

struct Admission {
    conn: Arc<ControlConnection>,
    outbound_rx: mpsc::Receiver<Envelope>,
    hello: ServerHello,
}

async fn serve_connection(
    ws: WebSocketStream<TokioIo<Upgraded>>,
    state: ServerState,
    peer_addr: SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello = match read_hello(&mut ws_rx).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!("control: bad hello, peer={}, error={}", peer_addr, e);
            metrics::counter!("tungo_connections_total", "status" => "invalid_hello").increment(1);
            let reply = ServerHello::failure(ServerHelloType::Error, e.to_string());
            send_hello(&mut ws_tx, &reply).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let admission = match admit(&state, &hello).await {
        Ok(admission) => admission,
        Err(reply) => {
            info!(
                "control: hello rejected, peer={}, reason={:?}",
                peer_addr, reply.kind
            );
            metrics::counter!("tungo_connections_total", "status" => "rejected").increment(1);
            send_hello(&mut ws_tx, &reply).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let Admission {
        conn,
        outbound_rx,
        hello: reply,
    } = admission;

    // Registry upsert is non-fatal: the connection still serves locally and
    // the heartbeat loop retries until the store recovers.
    let record = tunnel_record_for(&state, &conn);
    if let Err(e) = state.registry.register_tunnel(record).await {
        warn!(
            "control: registry upsert failed (serving locally), subdomain={}, error={}",
            conn.sub_domain, e
        );
    }

    if !send_hello(&mut ws_tx, &reply).await {
        teardown(&state, &conn).await;
        return;
    }

    info!(
        "control: tunnel connected, subdomain={}, client_id={}, peer={}",
        conn.sub_domain, conn.client_id, peer_addr
    );
    metrics::counter!("tungo_connections_total", "status" => "accepted").increment(1);

    let writer = tokio::spawn(write_pump(ws_tx, outbound_rx, conn.clone()));
    read_pump(&mut ws_rx, &state, &conn).await;

    teardown(&state, &conn).await;
    let _ = writer.await;
    info!(
        "control: tunnel disconnected, subdomain={}, client_id={}",
        conn.sub_domain, conn.client_id
    );
}

async fn read_hello(ws_rx: &mut WsReader) -> Result<ClientHello, TunnelError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, ws_rx.next())
        .await
        .map_err(|_| TunnelError::InvalidHello("hello deadline exceeded".into()))?;
    match frame {
        Some(Ok(Message::Text(text))) => codec::decode(text.as_str()),
        Some(Ok(other)) => Err(TunnelError::InvalidHello(format!(
            "expected text hello, got {} frame",
            message_kind(&other)
        ))),
        Some(Err(e)) => Err(TunnelError::InvalidHello(e.to_string())),
        None => Err(TunnelError::InvalidHello("connection closed before hello".into())),
    }
}

/// Authenticate, assign the subdomain, and claim a slot in the connection
/// manager. Every failure maps to the matching `ServerHello` variant.
async fn admit(state: &ServerState, hello: &ClientHello) -> Result<Admission, ServerHello> {
    let secret = hello.secret_key.as_ref().map(|s| s.key.as_str());
    match hello.client_type {
        ClientType::Auth => {
            if secret.map_or(true, str::is_empty) {
                return Err(ServerHello::failure(
                    ServerHelloType::AuthFailed,
                    "auth client requires a secret key",
                ));
            }
        }
        ClientType::Anonymous => {
            if state.config.require_auth || !state.config.allow_anonymous {
                return Err(ServerHello::failure(
                    ServerHelloType::AuthFailed,
                    "anonymous clients are not allowed",
                ));
            }
        }
    }

    let client_id = match secret {
        Some(secret) if hello.client_type == ClientType::Auth => derive_client_id(secret),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let sub_domain = match &hello.sub_domain {
        Some(requested) => {
            if !is_valid_subdomain(requested) {
                return Err(ServerHello::failure(
                    ServerHelloType::InvalidSubDomain,
                    format!("subdomain {:?} is not valid", requested),
                ));
            }
            requested.clone()
        }
        None => {
            // Collisions among 36^8 names are rare; bound the retry anyway.
            let mut candidate = generate_subdomain();
            for _ in 0..8 {
                if !state.connections.is_subdomain_taken(&candidate) {
                    break;
                }
                candidate = generate_subdomain();
            }
            candidate
        }
    };

    let password_hash = hello
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(crate::proxy::auth::password_hash);

    let (conn, outbound_rx) = ControlConnection::new(
        client_id.clone(),
        sub_domain.clone(),
        hello.client_version.clone(),
        password_hash,
    );

    match state.connections.add(conn.clone()) {
        Ok(()) => {}
        Err(TunnelError::SubdomainInUse(sub)) => {
            return Err(ServerHello::failure(
                ServerHelloType::SubDomainInUse,
                format!("subdomain {:?} already has a live tunnel", sub),
            ));
        }
        Err(e) => {
            return Err(ServerHello::failure(ServerHelloType::Error, e.to_string()));
        }
    }

    let mut reply = ServerHello::success(
        sub_domain.clone(),
        state.config.render_domain(&sub_domain),
        state.config.render_public_url(&sub_domain),
    );
    reply.client_id = Some(client_id);
    reply.reconnect_token = Some(match &hello.reconnect_token {
        Some(token) => token.clone(),
        None => ReconnectToken {
            token: uuid::Uuid::new_v4().to_string(),
        },
    });

    Ok(Admission {
        conn,
        outbound_rx,
        hello: reply,
    })
}

/// Directory record for a live connection. Also used by the heartbeat loop
/// to re-register tunnels the store lost.
pub(crate) fn tunnel_record_for(state: &ServerState, conn: &ControlConnection) -> TunnelRecord {
    TunnelRecord {
        subdomain: conn.sub_domain.clone(),
        server_id: state.config.id.clone(),
        server_host: state.config.host.clone(),
        client_id: conn.client_id.clone(),
        created_at: 0,
        last_seen_at: 0,
        proxy_port: state.config.port,
        control_port: state.config.control_port,
        password_hash: conn.password_hash.clone(),
    }
}

async fn send_hello(ws_tx: &mut WsWriter, hello: &ServerHello) -> bool {
    let Ok(text) = codec::encode(hello) else {
        return false;
    };
    ws_tx.send(Message::text(text)).await.is_ok()
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Drains the outbound queue onto the wire and emits a ping every 30 s.
/// Exits when the connection is revoked or the transport dies.
async fn write_pump(
    mut ws_tx: WsWriter,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    conn: Arc<ControlConnection>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_TICK);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset();

    loop {
        let envelope = tokio::select! {
            envelope = outbound_rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = heartbeat.tick() => Envelope::ping(),
            _ = conn.closed().cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        };

        let text = match codec::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("control: encode failed, client_id={}, error={}", conn.client_id, e);
                continue;
            }
        };
        if let Err(e) = ws_tx.send(Message::text(text)).await {
            debug!(
                "control: write failed, client_id={}, error={}",
                conn.client_id, e
            );
            conn.close();
            break;
        }
    }
}

/// Dispatches inbound envelopes until the transport errors, the peer closes,
/// or the connection is revoked.
async fn read_pump(ws_rx: &mut WsReader, state: &ServerState, conn: &Arc<ControlConnection>) {
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = conn.closed().cancelled() => return,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(
                    "control: read failed, client_id={}, error={}",
                    conn.client_id, e
                );
                return;
            }
            None => return,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                debug!(
                    "control: ignoring {:?} frame, client_id={}",
                    message_kind(&other),
                    conn.client_id
                );
                continue;
            }
        };

        let envelope: Envelope = match codec::decode(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "control: undecodable frame, client_id={}, error={}",
                    conn.client_id, e
                );
                continue;
            }
        };

        dispatch(state, conn, envelope);
    }
}

fn dispatch(_state: &ServerState, conn: &Arc<ControlConnection>, envelope: Envelope) {
    match envelope.kind {
        MessageType::Data => {
            let Some(stream_id) = envelope.stream_id.as_deref() else {
                warn!("control: data frame without stream_id, client_id={}", conn.client_id);
                return;
            };
            let Some(stream) = conn.get_stream(stream_id) else {
                debug!(
                    "control: data for unknown stream, client_id={}, stream_id={}",
                    conn.client_id, stream_id
                );
                return;
            };
            match codec::data_bytes(&envelope) {
                Ok(bytes) => {
                    // Delivery is non-blocking; a full router is a slow
                    // consumer and the chunk is dropped with a warning.
                    let _ = stream.deliver(Bytes::from(bytes));
                }
                Err(e) => warn!(
                    "control: bad data payload, client_id={}, stream_id={}, error={}",
                    conn.client_id, stream_id, e
                ),
            }
        }
        MessageType::End => {
            if let Some(stream_id) = envelope.stream_id.as_deref() {
                conn.remove_stream(stream_id);
            }
        }
        MessageType::Ping => {
            if let Err(e) = conn.send(Envelope::pong()) {
                debug!("control: pong enqueue failed, client_id={}, error={}", conn.client_id, e);
            }
        }
        MessageType::Pong => {
            // Liveness accounting only; the transport read itself is proof.
        }
        MessageType::Init | MessageType::Unknown => {
            warn!(
                "control: unexpected {:?} from client, client_id={}",
                envelope.kind, conn.client_id
            );
        }
    }
}

/// Remove the connection and, unless a newer connection already reclaimed
/// the subdomain, drop the tunnel from the registry.
async fn teardown(state: &ServerState, conn: &Arc<ControlConnection>) {
    state.connections.remove_conn(conn);
    conn.close();

    if state.connections.get_by_subdomain(&conn.sub_domain).is_none() {
        if let Err(e) = state.registry.unregister_tunnel(&conn.sub_domain).await {
            warn!(
                "control: registry unregister failed, subdomain={}, error={}",
                conn.sub_domain, e
            );
        }
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}
