use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded depth of a stream's inbound chunk channel.
pub const STREAM_CHANNEL_CAPACITY: usize = 512;

/// Cap on captured request/response bytes held for introspection.
pub const CAPTURE_LIMIT_BYTES: usize = 64 * 1024;

/// Outcome of a non-blocking chunk delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Channel full. The chunk was dropped (newest-wins backpressure
    /// policy).
    Dropped,
    /// Stream already ended or its connection closed.
    Closed,
}

/// One in-flight request/response exchange multiplexed over a control
/// connection.
///
/// The inbound channel is the only path for payload bytes: the read pump
/// holds the sender, exactly one consumer holds the receiver. The liveness
/// token fans out closure: cancelling it unblocks every task touching the
/// stream within one channel operation.
pub struct TunnelStream {
    pub id: String,
    pub protocol: String,
    /// Remote public address of the originating request, for logging.
    pub remote_addr: String,
    inbound_tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    request_bytes: AtomicUsize,
    response_bytes: AtomicUsize,
    capture: Mutex<Capture>,
}

#[derive(Default)]
struct Capture {
    request: Vec<u8>,
    response: Vec<u8>,
}

impl TunnelStream {
    /// Create a stream and hand back the receiving half of its inbound
    /// channel. The receiver goes to whichever task consumes payload bytes:
    /// the router on the server, the local-origin writer on the client.
    pub fn new(id: String, protocol: String, remote_addr: String) -> (Self, mpsc::Receiver<Bytes>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (
            Self {
                id,
                protocol,
                remote_addr,
                inbound_tx,
                closed: CancellationToken::new(),
                request_bytes: AtomicUsize::new(0),
                response_bytes: AtomicUsize::new(0),
                capture: Mutex::new(Capture::default()),
            },
            inbound_rx,
        )
    }

    /// Non-blocking delivery of an inbound chunk.
    pub fn deliver(&self, chunk: Bytes) -> Delivery {
        if self.closed.is_cancelled() {
            return Delivery::Closed;
        }
        match self.inbound_tx.try_send(chunk) {
            Ok(()) => Delivery::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "stream: inbound channel full, dropping chunk, stream_id={}",
                    self.id
                );
                metrics::counter!(
                    "tungo_send_buffer_dropped_total",
                    "direction" => "inbound",
                )
                .increment(1);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Revoke liveness. Idempotent; wakes every reader and writer.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    // ---- Introspection capture ----

    pub fn record_request(&self, bytes: &[u8]) {
        self.request_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        if let Ok(mut capture) = self.capture.lock() {
            append_capped(&mut capture.request, bytes);
        }
    }

    pub fn record_response(&self, bytes: &[u8]) {
        self.response_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        if let Ok(mut capture) = self.capture.lock() {
            append_capped(&mut capture.response, bytes);
        }
    }

    pub fn traffic(&self) -> (usize, usize) {
        (
            self.request_bytes.load(Ordering::Relaxed),
            self.response_bytes.load(Ordering::Relaxed),
        )
    }
}

fn append_capped(buf: &mut Vec<u8>, bytes: &[u8]) {
    let room = CAPTURE_LIMIT_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (TunnelStream, mpsc::Receiver<Bytes>) {
        TunnelStream::new("s-1".into(), "http".into(), "127.0.0.1:9".into())
    }

    #[test]
    fn test_deliver_and_receive_in_order() {
        let (stream, mut rx) = stream();
        assert_eq!(stream.deliver(Bytes::from_static(b"a")), Delivery::Accepted);
        assert_eq!(stream.deliver(Bytes::from_static(b"b")), Delivery::Accepted);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));
    }

    #[test]
    fn test_full_channel_drops_newest() {
        let (stream, mut rx) = stream();
        for _ in 0..STREAM_CHANNEL_CAPACITY {
            assert_eq!(stream.deliver(Bytes::from_static(b"x")), Delivery::Accepted);
        }
        assert_eq!(stream.deliver(Bytes::from_static(b"y")), Delivery::Dropped);
        // The overflow chunk never reaches the receiver.
        for _ in 0..STREAM_CHANNEL_CAPACITY {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"x"));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_stream_refuses_chunks() {
        let (stream, _rx) = stream();
        stream.close();
        assert_eq!(stream.deliver(Bytes::from_static(b"a")), Delivery::Closed);
        // close is idempotent
        stream.close();
        assert!(stream.is_closed());
    }

    #[test]
    fn test_dropped_receiver_reports_closed() {
        let (stream, rx) = stream();
        drop(rx);
        assert_eq!(stream.deliver(Bytes::from_static(b"a")), Delivery::Closed);
    }

    #[test]
    fn test_capture_is_bounded() {
        let (stream, _rx) = stream();
        let blob = vec![0u8; CAPTURE_LIMIT_BYTES];
        stream.record_response(&blob);
        stream.record_response(&blob);
        let (_, response_total) = stream.traffic();
        assert_eq!(response_total, 2 * CAPTURE_LIMIT_BYTES);
        assert_eq!(
            stream.capture.lock().unwrap().response.len(),
            CAPTURE_LIMIT_BYTES
        );
    }
}
