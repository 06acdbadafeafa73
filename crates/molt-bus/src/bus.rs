//! Per-protocol wiring of cache, dispatcher, inbound loops and policy.
//!
//! A [`MessageBus`] owns one protocol id on one transport. The policy type
//! parameter picks how messages on that protocol are disseminated, so a node
//! that needs both multicast and gossip starts two buses on two protocol ids.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::codec::{Delivery, Payload};
use crate::config::BusConfig;
use crate::connection::ConnectionCache;
use crate::dispatcher::{DispatcherStats, Outbound, OutboundDispatcher};
use crate::error::BusError;
use crate::identity::{Signer, Verifier};
use crate::inbound::{InboundProcessor, InboundStats, log_stream_end};
use crate::policy::{
    AckedMulticast, DirectDelivery, DisseminationPolicy, FloodGossip, PolicyContext,
};
use crate::protocol::{PeerId, ProtocolId};
use crate::telemetry::{Telemetry, TracingTelemetry};
use crate::transport::{StreamHandler, Transport};

/// Bus delivering every message straight to its handlers.
pub type DirectBus = MessageBus<DirectDelivery>;
/// Bus running acknowledged multicast.
pub type MulticastBus = MessageBus<AckedMulticast>;
/// Bus running flood gossip.
pub type GossipBus = MessageBus<FloodGossip>;

/// Configures and starts a [`MessageBus`].
pub struct MessageBusBuilder {
    transport: Arc<dyn Transport>,
    protocol: ProtocolId,
    config: BusConfig,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Arc<dyn Verifier>>,
    telemetry: Arc<dyn Telemetry>,
}

impl std::fmt::Debug for MessageBusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusBuilder")
            .field("protocol", &self.protocol)
            .field("config", &self.config)
            .field("signed", &self.signer.is_some())
            .field("verifies", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}

impl MessageBusBuilder {
    /// Starts a builder for `protocol` on `transport` with default settings.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, protocol: impl Into<ProtocolId>) -> Self {
        Self {
            transport,
            protocol: protocol.into(),
            config: BusConfig::default(),
            signer: None,
            verifier: None,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Signs every outgoing payload.
    ///
    /// The signer's peer id must be the transport's local peer id.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Verifies the signature of every incoming message.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replaces the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Registers the protocol on the transport and starts the dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Config`] for an invalid configuration, a signer
    /// that does not match the local peer, or a missing runtime; returns the
    /// transport's error if the protocol cannot be registered.
    pub fn start<P: DisseminationPolicy>(self) -> Result<MessageBus<P>, BusError> {
        self.config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| BusError::Config(format!("no tokio runtime: {e}")))?;
        let local = self.transport.local_peer_id();
        if let Some(signer) = &self.signer {
            if signer.peer_id() != local {
                return Err(BusError::Config(format!(
                    "signer {} does not match local peer {local}",
                    signer.peer_id()
                )));
            }
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let cache = Arc::new(
            ConnectionCache::new(self.protocol.clone(), Arc::clone(&self.transport))
                .with_connect_timeout(self.config.connect_timeout),
        );
        let (dispatcher, outbound) = OutboundDispatcher::new(
            self.protocol.clone(),
            local.clone(),
            &self.config,
            cache,
            self.signer,
            Arc::clone(&self.telemetry),
            tracker.clone(),
            cancel.clone(),
        );
        let policy = Arc::new(P::from_context(PolicyContext {
            local_peer: local.clone(),
            outbound: outbound.clone(),
            config: self.config.clone(),
            tracker: tracker.clone(),
        }));

        let mut processor = InboundProcessor::new(
            self.protocol.clone(),
            Arc::clone(&policy) as Arc<dyn DisseminationPolicy>,
            self.config.max_frame_len,
            self.telemetry,
        );
        if let Some(verifier) = self.verifier {
            processor = processor.with_verifier(verifier, self.config.require_signatures);
        }
        let inbound_stats = processor.stats();
        let handler = inbound_handler(
            self.protocol.clone(),
            Arc::new(processor),
            runtime,
            tracker.clone(),
            cancel.clone(),
        );
        self.transport
            .register_stream_handler(&self.protocol, handler)?;
        tracker.spawn(dispatcher.run());

        info!(
            protocol = %self.protocol,
            peer = %local,
            policy = policy.name(),
            "message bus started"
        );
        Ok(MessageBus {
            protocol: self.protocol,
            local,
            policy,
            outbound,
            inbound_stats,
            tracker,
            cancel,
        })
    }
}

/// Spawns one tracked read loop per inbound stream until cancelled.
fn inbound_handler(
    protocol: ProtocolId,
    processor: Arc<InboundProcessor>,
    runtime: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
) -> StreamHandler {
    Arc::new(move |remote: PeerId, stream| {
        if cancel.is_cancelled() {
            debug!(%protocol, peer = %remote, "bus stopped, dropping inbound stream");
            return;
        }
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        let protocol = protocol.clone();
        runtime.spawn(tracker.track_future(async move {
            let result = processor.run(remote.clone(), stream, cancel).await;
            log_stream_end(&protocol, &remote, &result);
        }));
    })
}

/// A running message bus for one protocol.
pub struct MessageBus<P> {
    protocol: ProtocolId,
    local: PeerId,
    policy: Arc<P>,
    outbound: Outbound,
    inbound_stats: Arc<InboundStats>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<P> std::fmt::Debug for MessageBus<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("protocol", &self.protocol)
            .field("local", &self.local)
            .field("running", &!self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<P: DisseminationPolicy> MessageBus<P> {
    /// Starts a builder for `protocol` on `transport`.
    #[must_use]
    pub fn builder(
        transport: Arc<dyn Transport>,
        protocol: impl Into<ProtocolId>,
    ) -> MessageBusBuilder {
        MessageBusBuilder::new(transport, protocol)
    }

    /// Starts a bus with default settings.
    ///
    /// # Errors
    ///
    /// See [`MessageBusBuilder::start`].
    pub fn start(
        transport: Arc<dyn Transport>,
        protocol: impl Into<ProtocolId>,
    ) -> Result<Self, BusError> {
        MessageBusBuilder::new(transport, protocol).start()
    }

    /// The protocol this bus serves.
    #[must_use]
    pub const fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    /// The local peer.
    #[must_use]
    pub const fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    /// The running policy.
    #[must_use]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Handle to the outbound queue.
    #[must_use]
    pub const fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Outbound counters.
    #[must_use]
    pub fn dispatcher_stats(&self) -> &DispatcherStats {
        self.outbound.stats()
    }

    /// Inbound counters across all read loops.
    #[must_use]
    pub fn inbound_stats(&self) -> &InboundStats {
        &self.inbound_stats
    }

    /// Sends a raw payload to `recipients`, bypassing the policy.
    ///
    /// # Errors
    ///
    /// See [`Outbound::send`].
    pub async fn send(
        &self,
        payload: &Payload,
        recipients: &[PeerId],
    ) -> Result<Vec<PeerId>, BusError> {
        self.outbound.send(payload, recipients).await
    }

    /// Returns false once shutdown has begun.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the dispatcher and every read loop and waits for them to end.
    ///
    /// Queued frames that have not been written are discarded.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(protocol = %self.protocol, peer = %self.local, "message bus stopped");
    }
}

impl MessageBus<DirectDelivery> {
    /// Registers a handler for every verified message.
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(&Delivery) -> Result<(), BusError> + Send + Sync + 'static,
    {
        self.policy.handlers().register(handler);
    }
}

impl<P> Drop for MessageBus<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
