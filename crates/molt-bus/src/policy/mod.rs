//! Dissemination policies.
//!
//! A policy decides what happens to a verified message once the inbound
//! processor has decoded it: deliver it, deduplicate it, acknowledge it or
//! relay it. Each protocol id runs exactly one policy.
//!
//! - [`DirectDelivery`]: hand every message to the handlers
//! - [`AckedMulticast`]: per-recipient acknowledgment with store-and-forward relay
//! - [`FloodGossip`]: duplicate suppression by id, relay left to handlers

pub mod gossip;
pub mod multicast;

pub use gossip::{FloodGossip, GOSSIP_KIND, GossipEvent};
pub use multicast::{AckedMulticast, DeliveryState, EVENT_KIND, Event, Recipient};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::task::TaskTracker;

use crate::codec::{Delivery, Payload};
use crate::config::BusConfig;
use crate::dispatcher::Outbound;
use crate::error::BusError;
use crate::handlers::HandlerRegistry;
use crate::protocol::PeerId;
use crate::transport::BoxFuture;

/// Codec tag for records carried as JSON inside a payload.
pub const JSON_CODEC: &str = "json";

/// Everything a policy needs from the bus that runs it.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// The local peer.
    pub local_peer: PeerId,
    /// Handle to the outbound queue.
    pub outbound: Outbound,
    /// Bus configuration.
    pub config: BusConfig,
    /// Tracker for background work spawned by the policy.
    pub tracker: TaskTracker,
}

/// Strategy applied to every verified inbound message of one protocol.
pub trait DisseminationPolicy: Send + Sync + 'static {
    /// Builds the policy for a starting bus.
    fn from_context(context: PolicyContext) -> Self
    where
        Self: Sized;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Processes one verified message.
    ///
    /// Errors are logged by the caller and never reach the sender.
    fn handle<'a>(&'a self, delivery: Delivery) -> BoxFuture<'a, Result<(), BusError>>;
}

/// Delivers every verified message to the handlers, with no dedup and no relay.
#[derive(Debug, Default)]
pub struct DirectDelivery {
    handlers: HandlerRegistry<Delivery>,
}

impl DirectDelivery {
    /// Creates a policy with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers invoked for every message.
    #[must_use]
    pub const fn handlers(&self) -> &HandlerRegistry<Delivery> {
        &self.handlers
    }
}

impl DisseminationPolicy for DirectDelivery {
    fn from_context(_context: PolicyContext) -> Self {
        Self::new()
    }

    fn name(&self) -> &'static str {
        "direct"
    }

    fn handle<'a>(&'a self, delivery: Delivery) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.handlers.dispatch(&delivery);
            Ok(())
        })
    }
}

/// Wraps a record as JSON in a payload of type `kind`.
pub(crate) fn encode_record<T: Serialize>(
    creator: &PeerId,
    kind: &str,
    record: &T,
) -> Result<Payload, BusError> {
    let data = serde_json::to_vec(record)?;
    Ok(Payload::new(creator.clone(), kind, data).with_codec(JSON_CODEC))
}

/// Extracts a record of type `kind` from a delivered payload.
pub(crate) fn decode_record<T: DeserializeOwned>(
    delivery: &Delivery,
    kind: &str,
) -> Result<T, BusError> {
    let payload = delivery.message.payload();
    if payload.kind() != kind {
        return Err(BusError::Decode(format!(
            "expected payload type {kind}, got {:?}",
            payload.kind()
        )));
    }
    serde_json::from_slice(payload.data())
        .map_err(|e| BusError::Decode(format!("invalid {kind} record: {e}")))
}
