use crate::client::origin;
use crate::config::{ClientConfig, ClusterMember};
use crate::conn::{ControlConnection, Delivery};
use crate::error::TunnelError;
use crate::protocol::codec;
use crate::protocol::{
    ClientHello, ClientType, Envelope, InitPayload, MessageType, ReconnectToken, SecretKey,
    ServerHello, ServerHelloType,
};
use crate::server::control::ws_config;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Client heartbeat cadence. The tick emits `pong`, matching the original
/// wire behavior; the server tolerates either direction.
const HEARTBEAT_TICK: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Session identity carried across reconnects: once a server assigns a
/// subdomain the client keeps asking for it.
#[derive(Default)]
struct Remembered {
    client_id: Option<String>,
    sub_domain: Option<String>,
    reconnect_token: Option<String>,
}

/// Dial → hello → pump, forever. Rotates through the configured cluster on
/// repeated failures and never returns except on shutdown.
pub async fn run(config: ClientConfig, shutdown: Arc<Notify>) {
    let cluster = config.cluster();
    let retry_interval = Duration::from_secs(config.retry_interval_secs.max(1));
    let extended_delay = (retry_interval * 6).min(Duration::from_secs(30));

    let mut remembered = Remembered {
        client_id: None,
        sub_domain: config.subdomain.clone(),
        reconnect_token: config.reconnect_token.clone(),
    };
    let mut member_index = 0usize;
    let mut consecutive_failures = 0u32;
    let mut members_exhausted = 0usize;

    loop {
        let member = &cluster[member_index % cluster.len()];

        let session = session(&config, member, &mut remembered, &shutdown);
        tokio::pin!(session);
        let outcome = tokio::select! {
            outcome = &mut session => outcome,
            _ = shutdown.notified() => return,
        };

        let mut delay = retry_interval;
        match outcome {
            Ok(()) => {
                // A session was established and later dropped; same member,
                // fresh counters.
                consecutive_failures = 0;
                members_exhausted = 0;
                info!(
                    "client: disconnected, reconnecting in {:?}, server={}:{}",
                    retry_interval, member.host, member.port
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    "client: connect failed ({}/{}), server={}:{}, error={}",
                    consecutive_failures, config.max_retries, member.host, member.port, e
                );
                if consecutive_failures >= config.max_retries.max(1) {
                    consecutive_failures = 0;
                    member_index = (member_index + 1) % cluster.len();
                    members_exhausted += 1;
                    if members_exhausted >= cluster.len() {
                        // Every member failed a full retry cycle; back off
                        // harder before the next rotation.
                        members_exhausted = 0;
                        delay = extended_delay;
                        info!("client: cluster exhausted, backing off {:?}", delay);
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => return,
        }
    }
}

/// One control-connection lifetime. `Ok(())` means the session was
/// established and later ended; `Err` means it never got through the hello.
async fn session(
    config: &ClientConfig,
    member: &ClusterMember,
    remembered: &mut Remembered,
    shutdown: &Arc<Notify>,
) -> Result<(), TunnelError> {
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
    let ws = tokio::time::timeout(connect_timeout, dial(config, member))
        .await
        .map_err(|_| TunnelError::InvalidHello("connect timed out".into()))??;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Hello exchange. A remembered subdomain survives reconnects.
    let hello = ClientHello {
        id: remembered.client_id.clone().unwrap_or_default(),
        sub_domain: remembered.sub_domain.clone(),
        client_type: if config.secret_key.is_some() {
            ClientType::Auth
        } else {
            ClientType::Anonymous
        },
        client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        secret_key: config
            .secret_key
            .clone()
            .map(|key| SecretKey { key }),
        reconnect_token: remembered
            .reconnect_token
            .clone()
            .map(|token| ReconnectToken { token }),
        password: config.password.clone(),
    };
    let text = codec::encode(&hello)?;
    ws_tx
        .send(Message::text(text))
        .await
        .map_err(|e| TunnelError::InvalidHello(format!("hello send failed: {}", e)))?;

    let reply = tokio::time::timeout(connect_timeout, ws_rx.next())
        .await
        .map_err(|_| TunnelError::InvalidHello("hello response timed out".into()))?;
    let reply: ServerHello = match reply {
        Some(Ok(Message::Text(text))) => codec::decode(text.as_str())?,
        Some(Ok(other)) => {
            return Err(TunnelError::InvalidHello(format!(
                "unexpected hello frame: {:?}",
                other
            )))
        }
        Some(Err(e)) => return Err(TunnelError::InvalidHello(e.to_string())),
        None => return Err(TunnelError::ConnectionClosed),
    };

    match reply.kind {
        ServerHelloType::Success => {}
        ServerHelloType::AuthFailed => return Err(TunnelError::AuthFailed),
        ServerHelloType::SubDomainInUse => {
            return Err(TunnelError::SubdomainInUse(
                reply.sub_domain.or(remembered.sub_domain.clone()).unwrap_or_default(),
            ))
        }
        ServerHelloType::InvalidSubDomain => {
            return Err(TunnelError::InvalidSubdomain(
                remembered.sub_domain.clone().unwrap_or_default(),
            ))
        }
        ServerHelloType::Error => {
            return Err(TunnelError::InvalidHello(
                reply.error.unwrap_or_else(|| "server rejected hello".into()),
            ))
        }
    }

    let sub_domain = reply.sub_domain.clone().unwrap_or_default();
    remembered.sub_domain = Some(sub_domain.clone());
    if let Some(client_id) = &reply.client_id {
        remembered.client_id = Some(client_id.clone());
    }
    if let Some(token) = &reply.reconnect_token {
        remembered.reconnect_token = Some(token.token.clone());
    }
    info!(
        "client: tunnel established, subdomain={}, public_url={}",
        sub_domain,
        reply.public_url.as_deref().unwrap_or("-")
    );

    // Pumps share a mirrored control-connection handle: outbound queue plus
    // the local stream table.
    let (conn, outbound_rx) = ControlConnection::new(
        remembered.client_id.clone().unwrap_or_default(),
        sub_domain,
        None,
        None,
    );

    let writer = tokio::spawn(write_pump(ws_tx, outbound_rx, conn.clone()));

    let local_addr = format!("{}:{}", config.local_host, config.local_port);
    read_pump(&mut ws_rx, &conn, &local_addr, shutdown).await;

    conn.close();
    let _ = writer.await;
    Ok(())
}

async fn dial(config: &ClientConfig, member: &ClusterMember) -> Result<WsStream, TunnelError> {
    let scheme = if member.secure { "wss" } else { "ws" };
    let url = format!("{}://{}:{}/ws", scheme, member.host, member.port);
    debug!("client: dialing, url={}", url);

    let connector = if member.secure && config.insecure_tls {
        let tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        Some(Connector::Rustls(Arc::new(tls)))
    } else {
        None
    };

    let (ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), Some(ws_config()), true, connector)
            .await
            .map_err(|e| TunnelError::InvalidHello(format!("dial failed: {}", e)))?;
    Ok(ws)
}

/// Drains the outbound queue onto the wire; the 30 s tick emits `pong`.
async fn write_pump(
    mut ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
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
            _ = heartbeat.tick() => Envelope::pong(),
            _ = conn.closed().cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        };

        let text = match codec::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("client: encode failed, error={}", e);
                continue;
            }
        };
        if ws_tx.send(Message::text(text)).await.is_err() {
            conn.close();
            break;
        }
    }
}

async fn read_pump(
    ws_rx: &mut futures_util::stream::SplitStream<WsStream>,
    conn: &Arc<ControlConnection>,
    local_addr: &str,
    shutdown: &Arc<Notify>,
) {
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = conn.closed().cancelled() => return,
            _ = shutdown.notified() => return,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("client: read failed, error={}", e);
                return;
            }
            None => return,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => continue,
        };

        let envelope: Envelope = match codec::decode(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("client: undecodable frame, error={}", e);
                continue;
            }
        };

        dispatch(conn, envelope, local_addr);
    }
}

fn dispatch(conn: &Arc<ControlConnection>, envelope: Envelope, local_addr: &str) {
    match envelope.kind {
        MessageType::Init => {
            let payload: InitPayload = match envelope
                .data
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
            {
                Some(payload) => payload,
                None => {
                    warn!("client: init frame without payload");
                    return;
                }
            };
            debug!(
                "client: stream opened, stream_id={}, protocol={}",
                payload.stream_id, payload.protocol
            );
            let (stream, inbound_rx) =
                conn.add_stream(&payload.stream_id, &payload.protocol, "server");
            tokio::spawn(origin::run_stream(
                stream,
                inbound_rx,
                conn.outbound_sender(),
                local_addr.to_string(),
            ));
        }
        MessageType::Data => {
            let Some(stream_id) = envelope.stream_id.as_deref() else {
                return;
            };
            let Some(stream) = conn.get_stream(stream_id) else {
                debug!("client: data for unknown stream, stream_id={}", stream_id);
                return;
            };
            match codec::data_bytes(&envelope) {
                Ok(bytes) => {
                    if stream.deliver(Bytes::from(bytes)) == Delivery::Dropped {
                        warn!("client: origin writer lagging, stream_id={}", stream_id);
                    }
                }
                Err(e) => warn!(
                    "client: bad data payload, stream_id={}, error={}",
                    stream_id, e
                ),
            }
        }
        MessageType::End => {
            if let Some(stream_id) = envelope.stream_id.as_deref() {
                conn.remove_stream(stream_id);
            }
        }
        MessageType::Ping => {
            let _ = conn.send(Envelope::pong());
        }
        MessageType::Pong => {}
        MessageType::Unknown => {
            debug!("client: ignoring unknown message type");
        }
    }
}

/// Certificate verifier for `insecure_tls`: accepts any chain. Internal or
/// self-signed deployments only.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
