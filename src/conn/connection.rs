use crate::conn::stream::TunnelStream;
use crate::error::TunnelError;
use crate::protocol::Envelope;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bounded depth of the outbound send queue feeding the write pump.
pub const SEND_QUEUE_CAPACITY: usize = 512;

/// Aggregate traffic figures for a connection's live streams.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSnapshot {
    pub streams: usize,
    pub request_bytes: usize,
    pub response_bytes: usize,
}

/// A live control connection: the server-side handle for one tunnel client
/// (and, mirrored, the client-side handle for its server).
///
/// Owns the outbound queue and the stream table. Sends never block: a full
/// queue fails fast with [`TunnelError::SendBufferFull`], a revoked
/// connection with [`TunnelError::ConnectionClosed`]. The table's lock is
/// sync and never held across an await or a channel send.
pub struct ControlConnection {
    pub client_id: String,
    pub sub_domain: String,
    pub client_version: Option<String>,
    /// `hex(sha256(password))` when the tunnel is password-protected.
    pub password_hash: Option<String>,
    outbound_tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
    streams: RwLock<HashMap<String, Arc<TunnelStream>>>,
}

impl ControlConnection {
    /// Create the connection plus the receiving half of its outbound queue,
    /// which the write pump drains onto the wire.
    pub fn new(
        client_id: String,
        sub_domain: String,
        client_version: Option<String>,
        password_hash: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                client_id,
                sub_domain,
                client_version,
                password_hash,
                outbound_tx,
                closed: CancellationToken::new(),
                streams: RwLock::new(HashMap::new()),
            }),
            outbound_rx,
        )
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ConnectionClosed);
        }
        match self.outbound_tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(
                    "tungo_send_buffer_dropped_total",
                    "direction" => "outbound",
                )
                .increment(1);
                Err(TunnelError::SendBufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TunnelError::ConnectionClosed),
        }
    }

    /// True once the write pump has drained everything we enqueued. Used as
    /// the advisory init acknowledgement before request bytes are sent.
    pub fn outbound_drained(&self) -> bool {
        self.outbound_tx.capacity() == self.outbound_tx.max_capacity()
    }

    /// Clone of the outbound sender for workers that prefer waiting on a
    /// free queue slot over failing fast (client-side origin streams).
    pub fn outbound_sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound_tx.clone()
    }

    // ---- Stream table ----

    pub fn add_stream(
        &self,
        stream_id: &str,
        protocol: &str,
        remote_addr: &str,
    ) -> (Arc<TunnelStream>, mpsc::Receiver<Bytes>) {
        let (stream, rx) = TunnelStream::new(
            stream_id.to_string(),
            protocol.to_string(),
            remote_addr.to_string(),
        );
        let stream = Arc::new(stream);
        self.streams
            .write()
            .expect("stream table lock poisoned")
            .insert(stream_id.to_string(), stream.clone());
        metrics::gauge!("tungo_streams_active").increment(1.0);
        (stream, rx)
    }

    pub fn get_stream(&self, stream_id: &str) -> Option<Arc<TunnelStream>> {
        self.streams
            .read()
            .expect("stream table lock poisoned")
            .get(stream_id)
            .cloned()
    }

    /// Idempotent: revokes the stream's liveness and drops it from the table.
    pub fn remove_stream(&self, stream_id: &str) {
        let removed = self
            .streams
            .write()
            .expect("stream table lock poisoned")
            .remove(stream_id);
        if let Some(stream) = removed {
            stream.close();
            metrics::gauge!("tungo_streams_active").decrement(1.0);
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().expect("stream table lock poisoned").len()
    }

    /// Live-stream totals for introspection.
    pub fn snapshot_traffic(&self) -> TrafficSnapshot {
        let table = self.streams.read().expect("stream table lock poisoned");
        let mut snapshot = TrafficSnapshot {
            streams: table.len(),
            request_bytes: 0,
            response_bytes: 0,
        };
        for stream in table.values() {
            let (request, response) = stream.traffic();
            snapshot.request_bytes += request;
            snapshot.response_bytes += response;
        }
        snapshot
    }

    // ---- Liveness ----

    /// Revoke the connection and every stream under it. Safe to call more
    /// than once; the stream table is drained outside any other lock.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let drained: Vec<Arc<TunnelStream>> = {
            let mut table = self.streams.write().expect("stream table lock poisoned");
            let count = table.len();
            if count > 0 {
                metrics::gauge!("tungo_streams_active").decrement(count as f64);
            }
            table.drain().map(|(_, s)| s).collect()
        };
        for stream in drained {
            stream.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (Arc<ControlConnection>, mpsc::Receiver<Envelope>) {
        ControlConnection::new("c1".into(), "demo".into(), None, None)
    }

    #[test]
    fn test_send_enqueues() {
        let (conn, mut rx) = connection();
        conn.send(Envelope::ping()).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(conn.outbound_drained());
    }

    #[test]
    fn test_send_queue_never_exceeds_capacity() {
        let (conn, _rx) = connection();
        for _ in 0..SEND_QUEUE_CAPACITY {
            conn.send(Envelope::ping()).unwrap();
        }
        assert!(!conn.outbound_drained());
        assert!(matches!(
            conn.send(Envelope::ping()),
            Err(TunnelError::SendBufferFull)
        ));
    }

    #[test]
    fn test_send_after_close_fails() {
        let (conn, _rx) = connection();
        conn.close();
        assert!(matches!(
            conn.send(Envelope::ping()),
            Err(TunnelError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_close_revokes_every_stream() {
        let (conn, _rx) = connection();
        let (s1, _rx1) = conn.add_stream("a", "http", "1.2.3.4:5");
        let (s2, _rx2) = conn.add_stream("b", "http", "1.2.3.4:6");
        assert_eq!(conn.stream_count(), 2);
        conn.close();
        assert!(s1.is_closed());
        assert!(s2.is_closed());
        assert_eq!(conn.stream_count(), 0);
    }

    #[test]
    fn test_remove_stream_idempotent() {
        let (conn, _rx) = connection();
        let (stream, _srx) = conn.add_stream("a", "http", "1.2.3.4:5");
        conn.remove_stream("a");
        conn.remove_stream("a");
        assert!(stream.is_closed());
        assert!(conn.get_stream("a").is_none());
    }
}
