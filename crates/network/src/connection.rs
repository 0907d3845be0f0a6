use crate::envelope::{EnvelopePayload, NetworkEnvelope};
use crate::error::{NetworkError, NetworkResult};
use crate::metrics::ConnectionMetrics;
use crate::network_load::NetworkLoadSnapshot;
use crate::transport::FrameSink;
use parking_lot::Mutex as SyncMutex;
use peernet_types::{Address, CloseReason, ConnectionId, NetworkLoad, TransportType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A live link to one peer, established after a successful handshake.
///
/// The connection owns its metrics and both load snapshots for its whole lifetime.
/// Metrics are only touched from [`Connection::send`], the node's handshake and its read loop.
pub struct Connection {
    id: ConnectionId,
    peer_address: Address,
    direction: Direction,
    metrics: ConnectionMetrics,
    // our own load as we last reported it to the peer
    network_load_snapshot: NetworkLoadSnapshot,
    // the peer's load as the peer last reported it
    peers_network_load_snapshot: NetworkLoadSnapshot,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    close_reason: SyncMutex<Option<CloseReason>>,
    reader: SyncMutex<Option<AbortHandle>>,
    established_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        peer_address: Address,
        direction: Direction,
        sink: Box<dyn FrameSink>,
        my_load: NetworkLoad,
        peers_load: NetworkLoad,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            peer_address,
            direction,
            metrics: ConnectionMetrics::new(),
            network_load_snapshot: NetworkLoadSnapshot::new(my_load),
            peers_network_load_snapshot: NetworkLoadSnapshot::new(peers_load.sanitized()),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            close_reason: SyncMutex::new(None),
            reader: SyncMutex::new(None),
            established_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer_address(&self) -> &Address {
        &self.peer_address
    }

    pub fn transport_type(&self) -> TransportType {
        self.peer_address.transport_type()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn network_load_snapshot(&self) -> &NetworkLoadSnapshot {
        &self.network_load_snapshot
    }

    pub fn peers_network_load_snapshot(&self) -> &NetworkLoadSnapshot {
        &self.peers_network_load_snapshot
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Writes one envelope. Fails with `SendFailed` if the link is closed or the write fails.
    pub async fn send(&self, payload: EnvelopePayload) -> NetworkResult<()> {
        let kind = payload.kind();
        let bytes = NetworkEnvelope::new(payload).to_bytes()?;

        let mut sink = self.sink.lock().await;
        // Re-checked under the sink lock so a concurrent close cannot interleave.
        if self.is_closed() {
            return Err(self.send_failed("connection is closed"));
        }

        let started = Instant::now();
        sink.send_frame(&bytes)
            .await
            .map_err(|e| self.send_failed(&e.to_string()))?;
        self.metrics.on_sent(kind, bytes.len(), started.elapsed());

        debug!("Sent {} ({} bytes) to {}", kind, bytes.len(), self.peer_address);
        Ok(())
    }

    /// Accounts for a handshake frame written before the connection existed.
    pub(crate) fn on_handshake_sent(&self, kind: &'static str, bytes: usize, send_time: Duration) {
        self.metrics.on_sent(kind, bytes, send_time);
    }

    pub(crate) fn on_received(&self, bytes: usize, deserialize_time: Duration) {
        self.metrics.on_received(bytes, deserialize_time);
    }

    pub(crate) fn on_round_trip(&self, rtt: Duration) {
        self.metrics.add_rtt(rtt);
    }

    pub(crate) fn set_reader(&self, reader: AbortHandle) {
        *self.reader.lock() = Some(reader);
    }

    pub(crate) fn abort_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Closes the link once. Returns false if it was already closed.
    pub(crate) async fn close(&self, reason: CloseReason, notify_peer: bool) -> bool {
        let mut sink = self.sink.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);

        if notify_peer {
            if let Ok(bytes) = NetworkEnvelope::new(EnvelopePayload::CloseConnection { reason }).to_bytes() {
                let _ = sink.send_frame(&bytes).await;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("Closing link to {} failed: {}", self.peer_address, e);
        }
        self.metrics.clear();

        debug!("Connection {} to {} closed: {}", self.id, self.peer_address, reason);
        true
    }

    fn send_failed(&self, reason: &str) -> NetworkError {
        NetworkError::SendFailed {
            address: self.peer_address.clone(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_address", &self.peer_address)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingSink {
        frames: Arc<SyncMutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            }
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection(sink: RecordingSink) -> Connection {
        Connection::new(
            Address::localhost(9000),
            Direction::Outbound,
            Box::new(sink),
            NetworkLoad::default(),
            NetworkLoad::new(0.4, 2),
        )
    }

    #[tokio::test]
    async fn test_send_updates_metrics() {
        let frames = Arc::new(SyncMutex::new(Vec::new()));
        let connection = connection(RecordingSink {
            frames: Arc::clone(&frames),
            fail: false,
        });

        connection.send(EnvelopePayload::Application(vec![0; 32])).await.unwrap();

        let snapshot = connection.metrics().snapshot();
        assert_eq!(snapshot.total.num_messages_sent, 1);
        assert_eq!(snapshot.total.sent_bytes, frames.lock()[0].len() as u64);
        assert_eq!(snapshot.sent_by_kind, vec![("Application".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_failed_write_is_send_failed() {
        let connection = connection(RecordingSink {
            fail: true,
            ..Default::default()
        });

        let err = connection.send(EnvelopePayload::Application(vec![1])).await.unwrap_err();
        assert!(matches!(err, NetworkError::SendFailed { .. }));
        assert_eq!(connection.metrics().snapshot().total.num_messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let frames = Arc::new(SyncMutex::new(Vec::new()));
        let connection = connection(RecordingSink {
            frames: Arc::clone(&frames),
            fail: false,
        });

        assert!(connection.close(CloseReason::ManuallyClosed, true).await);
        assert!(!connection.close(CloseReason::Shutdown, true).await);
        assert_eq!(connection.close_reason(), Some(CloseReason::ManuallyClosed));
        // Only the close notification went out.
        assert_eq!(frames.lock().len(), 1);

        let err = connection.send(EnvelopePayload::Application(vec![1])).await.unwrap_err();
        assert!(matches!(err, NetworkError::SendFailed { .. }));
    }

    #[tokio::test]
    async fn test_initial_snapshots() {
        let connection = connection(RecordingSink::default());
        assert_eq!(connection.peers_network_load_snapshot().current(), NetworkLoad::new(0.4, 2));
        assert_eq!(connection.network_load_snapshot().current(), NetworkLoad::default());
        assert_eq!(connection.transport_type(), TransportType::Clear);
    }
}
