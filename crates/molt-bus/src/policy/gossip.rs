//! Flood gossip.
//!
//! No acknowledgments: a node remembers the ids it has handled and drops
//! anything it has seen before. Receipt never relays on its own; a handler
//! that wants to keep the flood going calls [`FloodGossip::send`] again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{DisseminationPolicy, PolicyContext, decode_record, encode_record};
use crate::bounded::BoundedMap;
use crate::codec::Delivery;
use crate::dispatcher::Outbound;
use crate::error::BusError;
use crate::handlers::HandlerRegistry;
use crate::protocol::PeerId;
use crate::transport::BoxFuture;

/// Payload type carrying a [`GossipEvent`].
pub const GOSSIP_KIND: &str = "molt-bus/gossip";

/// A broadcast message with a flat recipient list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEvent {
    /// Application-defined event type.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Unique id used for duplicate suppression.
    pub id: String,
    /// The peer that created the event.
    #[serde(default)]
    pub owner_id: PeerId,
    /// The application payload.
    #[serde(default)]
    pub payload: Value,
    /// Peers to send to.
    #[serde(default)]
    pub recipients: Vec<PeerId>,
    /// The peer that transmitted this copy.
    #[serde(default, skip_serializing_if = "PeerId::is_empty")]
    pub sender_id: PeerId,
}

impl GossipEvent {
    /// Creates an event with a random id.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        owner_id: PeerId,
        payload: Value,
        recipients: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self::with_id(
            kind,
            uuid::Uuid::new_v4().to_string(),
            owner_id,
            payload,
            recipients,
        )
    }

    /// Creates an event with a caller-assigned id.
    #[must_use]
    pub fn with_id(
        kind: impl Into<String>,
        id: impl Into<String>,
        owner_id: PeerId,
        payload: Value,
        recipients: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            owner_id,
            payload,
            recipients: recipients.into_iter().collect(),
            sender_id: PeerId::default(),
        }
    }
}

/// Broadcast with id-based duplicate suppression and caller-driven relay.
pub struct FloodGossip {
    local: PeerId,
    outbound: Outbound,
    handled: Mutex<BoundedMap<String, ()>>,
    handlers: HandlerRegistry<GossipEvent>,
}

impl std::fmt::Debug for FloodGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloodGossip")
            .field("local", &self.local)
            .field("handled", &self.handled.lock().len())
            .finish_non_exhaustive()
    }
}

impl FloodGossip {
    /// Handlers invoked once per newly seen id.
    #[must_use]
    pub const fn handlers(&self) -> &HandlerRegistry<GossipEvent> {
        &self.handlers
    }

    /// Stamps the local peer as sender and queues the event for every
    /// recipient except the local peer.
    ///
    /// Sending does not mark the id as handled, so a copy that comes back
    /// is still delivered to the local handlers once.
    ///
    /// # Errors
    ///
    /// Returns an encoding error or [`BusError::QueueClosed`].
    pub async fn send(&self, mut event: GossipEvent) -> Result<Vec<PeerId>, BusError> {
        event.sender_id = self.local.clone();
        let payload = encode_record(&self.local, GOSSIP_KIND, &event)?;
        let sent = self.outbound.send(&payload, &event.recipients).await?;
        debug!(event_id = %event.id, recipients = sent.len(), "gossip sent");
        Ok(sent)
    }

    /// Returns true if `id` has been handled and is still remembered.
    #[must_use]
    pub fn has_handled(&self, id: &str) -> bool {
        self.handled.lock().contains(&id.to_string())
    }

    /// Forgets handled ids older than the seen-cache TTL.
    pub fn purge_expired(&self) -> usize {
        self.handled.lock().purge_expired()
    }
}

impl DisseminationPolicy for FloodGossip {
    fn from_context(context: PolicyContext) -> Self {
        Self {
            handled: Mutex::new(BoundedMap::new(
                context.config.seen_cache_capacity,
                Some(context.config.seen_cache_ttl),
            )),
            local: context.local_peer,
            outbound: context.outbound,
            handlers: HandlerRegistry::new(),
        }
    }

    fn name(&self) -> &'static str {
        "flood-gossip"
    }

    fn handle<'a>(&'a self, delivery: Delivery) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            let event: GossipEvent = decode_record(&delivery, GOSSIP_KIND)?;
            let first = self.handled.lock().insert_if_absent(event.id.clone(), ());
            if !first {
                debug!(event_id = %event.id, peer = %event.sender_id, "duplicate gossip dropped");
                return Ok(());
            }
            self.handlers.dispatch(&event);
            Ok(())
        })
    }
}
