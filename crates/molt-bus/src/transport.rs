//! Boundary to the peer network.
//!
//! The bus never dials sockets itself. It consumes a [`Transport`] that can
//! open a byte stream to a peer for a protocol and that hands inbound
//! streams to a registered [`StreamHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BusError;
use crate::protocol::{PeerId, ProtocolId};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream to a peer.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Owned, type-erased stream.
pub type BoxedStream = Box<dyn ByteStream>;

/// Callback invoked with the remote peer and the stream for every inbound
/// stream opened on a registered protocol.
pub type StreamHandler = Arc<dyn Fn(PeerId, BoxedStream) + Send + Sync>;

/// Peer network capability consumed by the bus.
pub trait Transport: Send + Sync {
    /// Returns the local peer's id.
    fn local_peer_id(&self) -> PeerId;

    /// Registers the handler for inbound streams on `protocol`.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler is already registered for `protocol`.
    fn register_stream_handler(
        &self,
        protocol: &ProtocolId,
        handler: StreamHandler,
    ) -> Result<(), BusError>;

    /// Opens a new stream to `peer` for `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the peer cannot be reached.
    fn open_stream<'a>(
        &'a self,
        protocol: &'a ProtocolId,
        peer: &'a PeerId,
    ) -> BoxFuture<'a, Result<BoxedStream, BusError>>;

    /// Opens a stream to an address of the form `<peer>/<protocol>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed or unreachable.
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<BoxedStream, BusError>> {
        Box::pin(async move {
            let (peer, protocol) = parse_address(address)?;
            self.open_stream(&protocol, &peer).await
        })
    }
}

/// Splits a `<peer>/<protocol>` address.
///
/// The protocol may itself contain slashes; the peer may not.
///
/// # Errors
///
/// Returns [`BusError::Transport`] if either part is missing.
pub fn parse_address(address: &str) -> Result<(PeerId, ProtocolId), BusError> {
    match address.split_once('/') {
        Some((peer, protocol)) if !peer.is_empty() && !protocol.is_empty() => {
            Ok((PeerId::new(peer), ProtocolId::new(protocol)))
        }
        _ => Err(BusError::Transport(format!("invalid address: {address}"))),
    }
}
