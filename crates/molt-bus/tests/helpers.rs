//! Test helpers for molt-bus integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use molt_bus::{
    BoxFuture, BoxedStream, BusError, MemoryTransport, PeerId, ProtocolId, StreamHandler,
    Transport,
};

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds or the test timeout expires.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Builds peer ids from string literals.
pub fn peers(ids: &[&str]) -> Vec<PeerId> {
    ids.iter().map(|id| PeerId::new(*id)).collect()
}

/// A memory transport that cannot open streams to one peer.
pub struct Partitioned {
    inner: Arc<MemoryTransport>,
    unreachable: PeerId,
}

impl Partitioned {
    pub fn new(inner: Arc<MemoryTransport>, unreachable: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            unreachable: PeerId::new(unreachable),
        })
    }
}

impl Transport for Partitioned {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id()
    }

    fn register_stream_handler(
        &self,
        protocol: &ProtocolId,
        handler: StreamHandler,
    ) -> Result<(), BusError> {
        self.inner.register_stream_handler(protocol, handler)
    }

    fn open_stream<'a>(
        &'a self,
        protocol: &'a ProtocolId,
        peer: &'a PeerId,
    ) -> BoxFuture<'a, Result<BoxedStream, BusError>> {
        if *peer == self.unreachable {
            return Box::pin(async move {
                Err(BusError::Transport(format!("no route to {peer}")))
            });
        }
        self.inner.open_stream(protocol, peer)
    }
}
