use crate::conn::TunnelStream;
use crate::protocol::Envelope;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The origin gets this long to produce its first response byte.
const FIRST_READ_DEADLINE: Duration = Duration::from_secs(5);
/// Once bytes have flowed, a quiet gap this long means end-of-response.
const NEXT_READ_DEADLINE: Duration = Duration::from_millis(500);
/// Hard budget for one response, mirroring the server's router deadline.
const RESPONSE_BUDGET: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 64 * 1024;

/// Per-stream adapter: replay tunneled request bytes onto a short-lived TCP
/// connection to the local origin and stream the response back as `data`
/// frames followed by `end`.
///
/// `inbound_rx` delivers request bytes from the server; `outbound` is the
/// control connection's send queue. The function owns the socket and always
/// emits a final `end` (or dies with the revoked stream).
pub async fn run_stream(
    stream: Arc<TunnelStream>,
    mut inbound_rx: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Envelope>,
    local_addr: String,
) {
    let stream_id = stream.id.clone();

    let socket = tokio::select! {
        result = TcpStream::connect(&local_addr) => result,
        _ = stream.closed().cancelled() => return,
    };
    let socket = match socket {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                "origin: connect failed, addr={}, stream_id={}, error={}",
                local_addr, stream_id, e
            );
            let _ = outbound.send(Envelope::end(&stream_id)).await;
            return;
        }
    };
    let _ = socket.set_nodelay(true);
    let (mut read_half, mut write_half) = socket.into_split();

    // Writer worker: request bytes from the server onto the local socket.
    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    chunk = inbound_rx.recv() => chunk,
                    _ = stream.closed().cancelled() => return,
                };
                let Some(chunk) = chunk else { return };
                stream.record_request(&chunk);
                if let Err(e) = write_half.write_all(&chunk).await {
                    debug!(
                        "origin: write failed, stream_id={}, error={}",
                        stream.id, e
                    );
                    return;
                }
            }
        })
    };

    // Reader loop: response bytes from the local socket back to the server.
    let deadline = tokio::time::Instant::now() + RESPONSE_BUDGET;
    let mut received_any = false;
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let window = if received_any {
            NEXT_READ_DEADLINE
        } else {
            FIRST_READ_DEADLINE
        };

        let read = tokio::select! {
            read = tokio::time::timeout(window, read_half.read(&mut buf)) => read,
            _ = stream.closed().cancelled() => break,
        };

        match read {
            Ok(Ok(0)) => break, // EOF, origin finished.
            Ok(Ok(n)) => {
                received_any = true;
                stream.record_response(&buf[..n]);
                if outbound
                    .send(Envelope::data(&stream.id, &buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("origin: read failed, stream_id={}, error={}", stream.id, e);
                break;
            }
            Err(_) => {
                // Deadline with bytes in hand: the response is complete.
                // Without bytes, keep waiting inside the hard budget.
                if received_any || tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    let _ = outbound.send(Envelope::end(&stream.id)).await;
    stream.close();
    writer.abort();
    debug!("origin: stream finished, stream_id={}", stream.id);
}
