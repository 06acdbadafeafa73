//! Error types for molt-bus.

use std::io;

use thiserror::Error;

/// Errors that can occur while encoding, sending or receiving messages.
#[derive(Debug, Error)]
pub enum BusError {
    /// The remote end closed the stream (broken-pipe class failure).
    ///
    /// Triggers eviction of the cached stream and a bounded requeue.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Any other transport failure. Not retried.
    #[error("transport error: {0}")]
    Transport(String),

    /// The frame itself could not be read or parsed as an envelope.
    ///
    /// Fatal to the read loop that produced it.
    #[error("frame error: {0}")]
    Frame(String),

    /// The message or payload inside a valid frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The carried hash does not match the hash of the carried message bytes.
    #[error("integrity check failed: expected {expected}, computed {actual}")]
    Integrity {
        /// Hash carried by the envelope (hex).
        expected: String,
        /// Hash recomputed over the message bytes (hex).
        actual: String,
    },

    /// Signature verification failed or a required signature is missing.
    #[error("signature error: {0}")]
    Signature(String),

    /// The outbound queue has been shut down.
    #[error("outbound queue closed")]
    QueueClosed,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An application handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Classifies an IO error raised while writing to a peer stream.
    #[must_use]
    pub fn from_write_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::ConnectionClosed(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }

    /// Returns true for failures that mean the cached stream is dead.
    #[must_use]
    pub const fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }

    /// Short label used in telemetry fields.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ConnectionClosed(_) => "broken_pipe",
            Self::Frame(_) => "frame",
            Self::Decode(_) | Self::Serialization(_) => "decode",
            Self::Integrity { .. } => "integrity",
            Self::Signature(_) => "signature",
            Self::Transport(_)
            | Self::QueueClosed
            | Self::Config(_)
            | Self::Handler(_) => "generic",
        }
    }

    /// Returns true if the error must terminate the inbound read loop.
    ///
    /// Only framing-level failures are fatal; anything wrong inside a
    /// well-formed frame is skipped.
    #[must_use]
    pub const fn is_fatal_to_stream(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}
