//! Outbound stream cache.
//!
//! - [`PeerStream`]: a cached stream to one peer plus write bookkeeping
//! - [`ConnectionCache`]: get-or-create by peer id, evicted on write failure
//!
//! Cached streams are not probed for liveness; a dead stream is only
//! discovered when a write to it fails.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::BusError;
use crate::protocol::{PeerId, ProtocolId};
use crate::transport::{BoxedStream, Transport};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A cached outbound stream to a single peer.
pub struct PeerStream {
    peer_id: PeerId,
    opened_at: DateTime<Utc>,
    frames_written: AtomicU64,
    writer: Mutex<BoxedStream>,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer_id", &self.peer_id)
            .field("opened_at", &self.opened_at)
            .field("frames_written", &self.frames_written())
            .finish_non_exhaustive()
    }
}

impl PeerStream {
    fn new(peer_id: PeerId, stream: BoxedStream) -> Self {
        Self {
            peer_id,
            opened_at: Utc::now(),
            frames_written: AtomicU64::new(0),
            writer: Mutex::new(stream),
        }
    }

    /// Returns the peer this stream leads to.
    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns when the stream was opened.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Number of frames successfully written.
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Writes one complete frame and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionClosed`] for broken-pipe class failures
    /// and stalls longer than `timeout`, [`BusError::Transport`] otherwise.
    pub async fn write_frame(&self, frame: &[u8], timeout: Duration) -> Result<(), BusError> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                self.frames_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => Err(BusError::from_write_error(&e)),
            Err(_) => Err(BusError::ConnectionClosed(format!(
                "write to {} stalled for {timeout:?}",
                self.peer_id
            ))),
        }
    }

    async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self.peer_id, error = %e, "stream shutdown failed");
        }
    }
}

/// Maps peer ids to open streams for one protocol.
pub struct ConnectionCache {
    protocol: ProtocolId,
    transport: Arc<dyn Transport>,
    streams: Mutex<HashMap<PeerId, Arc<PeerStream>>>,
    connect_timeout: Duration,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("protocol", &self.protocol)
            .field("connect_timeout", &self.connect_timeout)
            .field("evictions", &self.evictions())
            .finish_non_exhaustive()
    }
}

impl ConnectionCache {
    /// Creates an empty cache opening streams through `transport`.
    #[must_use]
    pub fn new(protocol: ProtocolId, transport: Arc<dyn Transport>) -> Self {
        Self {
            protocol,
            transport,
            streams: Mutex::new(HashMap::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            evictions: AtomicU64::new(0),
        }
    }

    /// Bounds how long opening a stream may take.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the cached stream for `peer`, opening one if needed.
    ///
    /// The map is not locked while a stream is opened, so a stalled open
    /// never blocks lookups for other peers. If two callers race to open
    /// the same peer, the first stream cached wins.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if no stream can be opened, or
    /// [`BusError::Transport`] if opening takes longer than the connect
    /// timeout.
    pub async fn get_or_create(&self, peer: &PeerId) -> Result<Arc<PeerStream>, BusError> {
        let cached = self.streams.lock().await.get(peer).cloned();
        if let Some(stream) = cached {
            return Ok(stream);
        }

        let open = self.transport.open_stream(&self.protocol, peer);
        let stream = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| {
                BusError::Transport(format!(
                    "opening stream to {peer} timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(peer) {
            return Ok(Arc::clone(existing));
        }
        info!(protocol = %self.protocol, %peer, "opened stream");
        let stream = Arc::new(PeerStream::new(peer.clone(), stream));
        streams.insert(peer.clone(), Arc::clone(&stream));
        Ok(stream)
    }

    /// Drops the cached stream for `peer`, if any.
    pub async fn evict(&self, peer: &PeerId) -> Option<Arc<PeerStream>> {
        let removed = self.streams.lock().await.remove(peer);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(protocol = %self.protocol, %peer, "evicted stream");
        }
        removed
    }

    /// Returns true if a stream to `peer` is cached.
    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.streams.lock().await.contains_key(peer)
    }

    /// Number of cached streams.
    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Returns true if no stream is cached.
    pub async fn is_empty(&self) -> bool {
        self.streams.lock().await.is_empty()
    }

    /// Number of evictions so far.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Shuts down and forgets every cached stream.
    pub async fn close_all(&self) {
        let streams: Vec<_> = self.streams.lock().await.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::transport::{BoxFuture, StreamHandler};
    use parking_lot::Mutex as SyncMutex;

    const PROTOCOL: &str = "echo";

    /// Keeps inbound streams alive so writes to them succeed.
    fn holding_handler() -> (StreamHandler, Arc<SyncMutex<Vec<BoxedStream>>>) {
        let held = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&held);
        let handler: StreamHandler = Arc::new(move |_, stream| sink.lock().push(stream));
        (handler, held)
    }

    /// Accepts nothing: every open hangs.
    struct NeverOpens(Arc<crate::memory::MemoryTransport>);

    impl Transport for NeverOpens {
        fn local_peer_id(&self) -> PeerId {
            self.0.local_peer_id()
        }

        fn register_stream_handler(
            &self,
            protocol: &ProtocolId,
            handler: StreamHandler,
        ) -> Result<(), BusError> {
            self.0.register_stream_handler(protocol, handler)
        }

        fn open_stream<'a>(
            &'a self,
            _protocol: &'a ProtocolId,
            _peer: &'a PeerId,
        ) -> BoxFuture<'a, Result<BoxedStream, BusError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn get_or_create_reuses_stream() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let (handler, _held) = holding_handler();
        b.register_stream_handler(&ProtocolId::new(PROTOCOL), handler)
            .expect("register");

        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a.clone());
        let first = cache.get_or_create(&PeerId::new("b")).await.expect("open");
        let second = cache.get_or_create(&PeerId::new("b")).await.expect("cached");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a.streams_opened(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn evict_forces_reopen() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let (handler, _held) = holding_handler();
        b.register_stream_handler(&ProtocolId::new(PROTOCOL), handler)
            .expect("register");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a.clone());
        let peer = PeerId::new("b");

        cache.get_or_create(&peer).await.expect("open");
        assert!(cache.evict(&peer).await.is_some());
        assert!(!cache.contains(&peer).await);
        cache.get_or_create(&peer).await.expect("reopen");

        assert_eq!(a.streams_opened(), 2);
        assert_eq!(cache.evictions(), 1);
    }

    #[tokio::test]
    async fn evict_missing_peer_is_noop() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a);

        assert!(cache.evict(&PeerId::new("b")).await.is_none());
        assert_eq!(cache.evictions(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_not_cached() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a);

        assert!(cache.get_or_create(&PeerId::new("ghost")).await.is_err());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn write_to_dropped_remote_is_connection_closed() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        // Drops every inbound stream immediately.
        b.register_stream_handler(&ProtocolId::new(PROTOCOL), Arc::new(|_, _| {}))
            .expect("register");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a);

        let stream = cache.get_or_create(&PeerId::new("b")).await.expect("open");
        let err = stream
            .write_frame(b"frame\n", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(err.is_connection_closed());
        assert_eq!(stream.frames_written(), 0);
    }

    #[tokio::test]
    async fn stalled_write_is_connection_closed() {
        let network = MemoryNetwork::with_pipe_buffer(16);
        let a = network.join("a");
        let b = network.join("b");
        // Holds the stream but never reads, so the pipe fills up.
        let (handler, held) = holding_handler();
        b.register_stream_handler(&ProtocolId::new(PROTOCOL), handler)
            .expect("register");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a);

        let stream = cache.get_or_create(&PeerId::new("b")).await.expect("open");
        let err = stream
            .write_frame(&[b'x'; 1024], Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(err.is_connection_closed());
        assert_eq!(stream.frames_written(), 0);
        assert_eq!(held.lock().len(), 1);
    }

    #[tokio::test]
    async fn open_timeout_is_transport_error_and_not_cached() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let transport: Arc<dyn Transport> = Arc::new(NeverOpens(a));
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), transport)
            .with_connect_timeout(Duration::from_millis(20));

        let err = cache.get_or_create(&PeerId::new("b")).await.unwrap_err();

        assert!(matches!(err, BusError::Transport(_)));
        assert!(!err.is_connection_closed());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn write_frame_counts_successes() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");
        let (handler, held) = holding_handler();
        b.register_stream_handler(&ProtocolId::new(PROTOCOL), handler)
            .expect("register");
        let cache = ConnectionCache::new(ProtocolId::new(PROTOCOL), a);

        let stream = cache.get_or_create(&PeerId::new("b")).await.expect("open");
        stream
            .write_frame(b"one\n", Duration::from_secs(1))
            .await
            .expect("write");
        stream
            .write_frame(b"two\n", Duration::from_secs(1))
            .await
            .expect("write");

        assert_eq!(stream.frames_written(), 2);
        assert_eq!(held.lock().len(), 1);
    }
}
