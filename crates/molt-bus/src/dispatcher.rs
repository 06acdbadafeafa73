//! Outbound dispatcher: a bounded queue drained by one worker.
//!
//! [`Outbound`] is the cloneable sending half. It encodes a payload once and
//! enqueues one work item per recipient; when the queue is full, `send`
//! waits for a free slot. [`OutboundDispatcher::run`] drains the queue
//! sequentially, writing each frame through the [`ConnectionCache`].
//!
//! A broken-pipe class failure evicts the cached stream and requeues the
//! item after a backoff, up to the configured number of attempts. Every
//! other failure drops the item.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::{Envelope, Payload, encode};
use crate::config::{BusConfig, RetryPolicy};
use crate::connection::ConnectionCache;
use crate::error::BusError;
use crate::identity::Signer;
use crate::protocol::{PeerId, ProtocolId};
use crate::telemetry::{MESSAGE_DROPPED, MESSAGE_SENT, Telemetry, TelemetryFields, fields};

/// One frame addressed to one recipient.
#[derive(Debug, Clone)]
struct WorkItem {
    frame: Arc<[u8]>,
    payload_len: usize,
    recipient: PeerId,
    attempts: u32,
}

/// Counters kept by the dispatcher worker.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl DispatcherStats {
    /// Work items accepted by [`Outbound::send`].
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Frames written successfully.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Items dropped after a non-retryable failure.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Items put back on the queue after a closed connection.
    #[must_use]
    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Items dropped after exhausting their attempts.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sending half of the dispatcher queue.
#[derive(Clone)]
pub struct Outbound {
    local: PeerId,
    queue: mpsc::Sender<WorkItem>,
    signer: Option<Arc<dyn Signer>>,
    stats: Arc<DispatcherStats>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("local", &self.local)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl Outbound {
    /// The local peer; never used as a recipient.
    #[must_use]
    pub const fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    /// Dispatcher counters.
    #[must_use]
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Encodes `payload` once and enqueues it for every recipient except the
    /// local peer.
    ///
    /// Returns the recipients that were enqueued. Delivery happens later on
    /// the dispatcher worker and its failures are never reported here.
    ///
    /// # Errors
    ///
    /// Returns an encoding error, or [`BusError::QueueClosed`] once the
    /// dispatcher has stopped.
    pub async fn send(
        &self,
        payload: &Payload,
        recipients: &[PeerId],
    ) -> Result<Vec<PeerId>, BusError> {
        let envelope = encode(payload, self.signer.as_deref())?;
        self.send_envelope(&envelope, payload.data().len(), recipients)
            .await
    }

    async fn send_envelope(
        &self,
        envelope: &Envelope,
        payload_len: usize,
        recipients: &[PeerId],
    ) -> Result<Vec<PeerId>, BusError> {
        let frame: Arc<[u8]> = envelope.to_frame()?.into();
        let mut targets = Vec::with_capacity(recipients.len());
        for recipient in recipients.iter().filter(|r| **r != self.local) {
            let item = WorkItem {
                frame: Arc::clone(&frame),
                payload_len,
                recipient: recipient.clone(),
                attempts: 0,
            };
            self.queue
                .send(item)
                .await
                .map_err(|_| BusError::QueueClosed)?;
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            targets.push(recipient.clone());
        }
        Ok(targets)
    }
}

/// The receiving half of the queue and the worker that drains it.
pub struct OutboundDispatcher {
    protocol: ProtocolId,
    queue: mpsc::Receiver<WorkItem>,
    requeue: mpsc::Sender<WorkItem>,
    cache: Arc<ConnectionCache>,
    telemetry: Arc<dyn Telemetry>,
    stats: Arc<DispatcherStats>,
    retry: RetryPolicy,
    write_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OutboundDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundDispatcher")
            .field("protocol", &self.protocol)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OutboundDispatcher {
    /// Creates the queue and returns the worker with its sending handle.
    ///
    /// Nothing is written until [`run`](Self::run) is polled. Delayed
    /// requeues are spawned on `tracker` and stop on `cancel`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: ProtocolId,
        local: PeerId,
        config: &BusConfig,
        cache: Arc<ConnectionCache>,
        signer: Option<Arc<dyn Signer>>,
        telemetry: Arc<dyn Telemetry>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(DispatcherStats::default());
        let outbound = Outbound {
            local,
            queue: tx.clone(),
            signer,
            stats: Arc::clone(&stats),
        };
        let dispatcher = Self {
            protocol,
            queue: rx,
            requeue: tx,
            cache,
            telemetry,
            stats,
            retry: config.retry.clone(),
            write_timeout: config.write_timeout,
            tracker,
            cancel,
        };
        (dispatcher, outbound)
    }

    /// Drains the queue until cancelled, then closes every cached stream.
    pub async fn run(mut self) {
        info!(protocol = %self.protocol, "dispatcher started");
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = self.queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.process(item) => {}
            }
        }
        self.queue.close();
        self.cache.close_all().await;
        info!(protocol = %self.protocol, "dispatcher stopped");
    }

    /// Pops one queued frame without writing it.
    #[cfg(test)]
    pub(crate) fn try_next_frame(&mut self) -> Option<(PeerId, Vec<u8>)> {
        self.queue
            .try_recv()
            .ok()
            .map(|item| (item.recipient, item.frame.to_vec()))
    }

    async fn process(&self, mut item: WorkItem) {
        item.attempts += 1;
        let result = self.transmit(&item).await;
        let mut telemetry = fields([
            ("protocol", Value::from(self.protocol.as_str())),
            ("peer", Value::from(item.recipient.as_str())),
            ("envelope_bytes", Value::from(item.frame.len())),
            ("payload_bytes", Value::from(item.payload_len)),
        ]);

        match result {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    protocol = %self.protocol,
                    peer = %item.recipient,
                    attempt = item.attempts,
                    "frame sent"
                );
                self.telemetry.publish(MESSAGE_SENT, &telemetry);
            }
            Err(e) if e.is_connection_closed() => {
                self.cache.evict(&item.recipient).await;
                telemetry.insert("error".to_string(), Value::from(e.label()));
                self.telemetry.publish(MESSAGE_SENT, &telemetry);
                if self.retry.allows_retry(item.attempts) {
                    self.schedule_retry(item, &e);
                } else {
                    self.give_up(&item, &e, telemetry);
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    protocol = %self.protocol,
                    peer = %item.recipient,
                    error = %e,
                    "dropping frame"
                );
                telemetry.insert("error".to_string(), Value::from(e.label()));
                self.telemetry.publish(MESSAGE_SENT, &telemetry);
            }
        }
    }

    async fn transmit(&self, item: &WorkItem) -> Result<(), BusError> {
        let stream = self.cache.get_or_create(&item.recipient).await?;
        stream.write_frame(&item.frame, self.write_timeout).await
    }

    fn schedule_retry(&self, item: WorkItem, cause: &BusError) {
        let delay = self.retry.backoff(item.attempts);
        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
        warn!(
            protocol = %self.protocol,
            peer = %item.recipient,
            attempt = item.attempts,
            ?delay,
            error = %cause,
            "connection closed, requeueing"
        );

        let queue = self.requeue.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = async {
                    tokio::time::sleep(delay).await;
                    // A closed queue means the dispatcher already stopped.
                    let _ = queue.send(item).await;
                } => {}
            }
        });
    }

    fn give_up(&self, item: &WorkItem, cause: &BusError, mut telemetry: TelemetryFields) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            protocol = %self.protocol,
            peer = %item.recipient,
            attempts = item.attempts,
            error = %cause,
            "retries exhausted, dropping frame"
        );
        telemetry.insert("attempts".to_string(), Value::from(item.attempts));
        self.telemetry.publish(MESSAGE_DROPPED, &telemetry);
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
