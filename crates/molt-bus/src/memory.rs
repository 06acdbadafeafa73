//! In-process transport built on `tokio::io::duplex`.
//!
//! Peers join a shared [`MemoryNetwork`]; opening a stream hands one end of
//! a duplex pipe to the remote peer's registered handler and returns the
//! other end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::BusError;
use crate::protocol::{PeerId, ProtocolId};
use crate::transport::{BoxFuture, BoxedStream, StreamHandler, Transport};

/// Default duplex buffer per stream direction.
const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

/// A set of in-process peers that can open streams to each other.
#[derive(Debug)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<PeerId, Arc<MemoryTransport>>>,
    pipe_buffer: usize,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_pipe_buffer(DEFAULT_PIPE_BUFFER)
    }

    /// Creates an empty network whose pipes buffer `pipe_buffer` bytes.
    #[must_use]
    pub fn with_pipe_buffer(pipe_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            pipe_buffer,
        })
    }

    /// Adds a peer and returns its transport.
    ///
    /// Joining twice with the same id replaces the earlier transport.
    pub fn join(self: &Arc<Self>, peer: impl Into<PeerId>) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            local: peer.into(),
            network: Arc::downgrade(self),
            handlers: RwLock::new(HashMap::new()),
            streams_opened: AtomicU64::new(0),
        });
        self.peers
            .write()
            .insert(transport.local.clone(), Arc::clone(&transport));
        transport
    }

    /// Removes a peer; later stream opens to it fail.
    pub fn leave(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<MemoryTransport>> {
        self.peers.read().get(peer).cloned()
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: PeerId,
    network: Weak<MemoryNetwork>,
    handlers: RwLock<HashMap<ProtocolId, StreamHandler>>,
    streams_opened: AtomicU64,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local", &self.local)
            .field("protocols", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("streams_opened", &self.streams_opened())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Number of outbound streams this peer has opened.
    #[must_use]
    pub fn streams_opened(&self) -> u64 {
        self.streams_opened.load(Ordering::Relaxed)
    }

    fn handler(&self, protocol: &ProtocolId) -> Option<StreamHandler> {
        self.handlers.read().get(protocol).cloned()
    }
}

impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    fn register_stream_handler(
        &self,
        protocol: &ProtocolId,
        handler: StreamHandler,
    ) -> Result<(), BusError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(protocol) {
            return Err(BusError::Transport(format!(
                "handler already registered for {protocol}"
            )));
        }
        handlers.insert(protocol.clone(), handler);
        Ok(())
    }

    fn open_stream<'a>(
        &'a self,
        protocol: &'a ProtocolId,
        peer: &'a PeerId,
    ) -> BoxFuture<'a, Result<BoxedStream, BusError>> {
        Box::pin(async move {
            let network = self
                .network
                .upgrade()
                .ok_or_else(|| BusError::Transport("network is gone".to_string()))?;
            let remote = network
                .lookup(peer)
                .ok_or_else(|| BusError::Transport(format!("could not resolve peer {peer}")))?;
            let handler = remote.handler(protocol).ok_or_else(|| {
                BusError::Transport(format!("peer {peer} does not speak {protocol}"))
            })?;

            let (local_end, remote_end) = tokio::io::duplex(network.pipe_buffer);
            handler(self.local.clone(), Box::new(remote_end));
            self.streams_opened.fetch_add(1, Ordering::Relaxed);
            debug!(local = %self.local, %peer, %protocol, "opened memory stream");

            Ok(Box::new(local_end) as BoxedStream)
        })
    }
}
