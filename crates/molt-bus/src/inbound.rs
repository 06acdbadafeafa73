//! Inbound processor: one read loop per inbound stream.
//!
//! Each iteration reads exactly one newline-delimited frame. A failure to
//! read or parse the frame as an envelope ends the loop; anything wrong
//! inside a well-formed envelope (hash, message, payload, signature) skips
//! that frame and the loop keeps reading.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Delivery, Envelope, Payload};
use crate::error::BusError;
use crate::identity::Verifier;
use crate::policy::DisseminationPolicy;
use crate::protocol::{PeerId, ProtocolId};
use crate::telemetry::{MESSAGE_RECEIVED, Telemetry, fields};
use crate::transport::BoxedStream;

/// Why a read loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The remote closed the stream.
    Closed,
    /// The bus was shut down.
    Cancelled,
}

/// Per-loop counters.
#[derive(Debug, Default)]
pub struct InboundStats {
    delivered: AtomicU64,
    skipped: AtomicU64,
}

impl InboundStats {
    /// Frames handed to the policy.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames skipped for integrity, decode or signature failures.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Decodes frames from inbound streams and hands them to a policy.
pub struct InboundProcessor {
    protocol: ProtocolId,
    policy: Arc<dyn DisseminationPolicy>,
    verifier: Option<Arc<dyn Verifier>>,
    require_signatures: bool,
    max_frame_len: usize,
    telemetry: Arc<dyn Telemetry>,
    stats: Arc<InboundStats>,
}

impl std::fmt::Debug for InboundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundProcessor")
            .field("protocol", &self.protocol)
            .field("verifies", &self.verifier.is_some())
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

impl InboundProcessor {
    /// Creates a processor delivering to `policy`.
    #[must_use]
    pub fn new(
        protocol: ProtocolId,
        policy: Arc<dyn DisseminationPolicy>,
        max_frame_len: usize,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            protocol,
            policy,
            verifier: None,
            require_signatures: false,
            max_frame_len,
            telemetry,
            stats: Arc::new(InboundStats::default()),
        }
    }

    /// Checks signatures with `verifier`; unsigned messages are rejected
    /// when `required` is set.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>, required: bool) -> Self {
        self.verifier = Some(verifier);
        self.require_signatures = required;
        self
    }

    /// Counters shared by every loop this processor runs.
    #[must_use]
    pub fn stats(&self) -> Arc<InboundStats> {
        Arc::clone(&self.stats)
    }

    /// Reads frames from `stream` until it closes, a frame error occurs, or
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Frame`] when a frame cannot be read or is not an
    /// envelope.
    pub async fn run(
        &self,
        remote: PeerId,
        stream: BoxedStream,
        cancel: CancellationToken,
    ) -> Result<StreamEnd, BusError> {
        let codec = LinesCodec::new_with_max_length(self.max_frame_len);
        let mut frames = FramedRead::new(stream, codec);
        debug!(protocol = %self.protocol, peer = %remote, "read loop started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = frames.next() => next,
            };
            let line = match next {
                None => {
                    debug!(protocol = %self.protocol, peer = %remote, "stream closed");
                    return Ok(StreamEnd::Closed);
                }
                Some(Err(e)) => {
                    warn!(
                        protocol = %self.protocol,
                        peer = %remote,
                        error = %e,
                        "read failed, closing stream"
                    );
                    return Err(BusError::Frame(e.to_string()));
                }
                Some(Ok(line)) => line,
            };

            match self.accept(&line) {
                Ok(delivery) => self.deliver(&remote, line.len(), delivery).await,
                Err(e) if e.is_fatal_to_stream() => {
                    self.publish_received(line.len(), None, Some(&e));
                    warn!(
                        protocol = %self.protocol,
                        peer = %remote,
                        error = %e,
                        "malformed frame, closing stream"
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    self.publish_received(line.len(), None, Some(&e));
                    warn!(protocol = %self.protocol, peer = %remote, error = %e, "skipping frame");
                }
            }
        }
    }

    fn accept(&self, line: &str) -> Result<Delivery, BusError> {
        let delivery = Envelope::from_frame(line.as_bytes())?.open()?;
        if let Some(verifier) = &self.verifier {
            delivery
                .message
                .verify_signature(verifier.as_ref(), self.require_signatures)?;
        }
        Ok(delivery)
    }

    fn publish_received(
        &self,
        frame_len: usize,
        payload: Option<&Payload>,
        error: Option<&BusError>,
    ) {
        let mut telemetry = fields([
            ("protocol", Value::from(self.protocol.as_str())),
            ("envelope_bytes", Value::from(frame_len)),
        ]);
        if let Some(payload) = payload {
            telemetry.insert("payload_bytes".to_string(), Value::from(payload.data().len()));
            telemetry.insert("type".to_string(), Value::from(payload.kind()));
        }
        if let Some(error) = error {
            telemetry.insert("error".to_string(), Value::from(error.label()));
        }
        self.telemetry.publish(MESSAGE_RECEIVED, &telemetry);
    }

    async fn deliver(&self, remote: &PeerId, frame_len: usize, delivery: Delivery) {
        let payload = delivery.message.payload();
        self.publish_received(frame_len, Some(payload), None);
        debug!(
            protocol = %self.protocol,
            peer = %remote,
            hash = %delivery.hash,
            kind = payload.kind(),
            "frame received"
        );
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.policy.handle(delivery).await {
            warn!(protocol = %self.protocol, peer = %remote, error = %e, "policy rejected message");
        }
    }
}

/// Logs how a read loop ended.
pub(crate) fn log_stream_end(
    protocol: &ProtocolId,
    remote: &PeerId,
    result: &Result<StreamEnd, BusError>,
) {
    match result {
        Ok(end) => debug!(%protocol, peer = %remote, ?end, "read loop finished"),
        Err(e) => info!(%protocol, peer = %remote, error = %e, "read loop terminated"),
    }
}
