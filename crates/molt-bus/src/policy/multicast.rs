//! Acknowledged multicast.
//!
//! Every [`Event`] carries its recipient list with one ack flag per peer.
//! A node that receives an unknown event stores it, acks the owner, the
//! sender and itself, runs the handlers and relays the event to every
//! recipient it has not yet seen ack. Receiving a known event again is the
//! acknowledgment: the sender of that copy is marked acked and nothing else
//! happens.
//!
//! Only `PDU` events are stored and relayed on receipt.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{DisseminationPolicy, PolicyContext, decode_record, encode_record};
use crate::bounded::BoundedMap;
use crate::codec::Delivery;
use crate::dispatcher::Outbound;
use crate::error::BusError;
use crate::handlers::HandlerRegistry;
use crate::protocol::PeerId;
use crate::transport::BoxFuture;

/// Payload type carrying an [`Event`].
pub const EVENT_KIND: &str = "molt-bus/event";

/// One target peer of an event and whether it is known to have the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    peer_id: PeerId,
    #[serde(default)]
    ack: bool,
}

impl Recipient {
    /// The recipient's peer id.
    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// True once the recipient is known to have the event.
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        self.ack
    }
}

/// Acknowledgment progress of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// No recipient has acked.
    Unsent,
    /// Some recipients have acked.
    PartiallyAcked,
    /// Every recipient has acked.
    FullyAcked,
}

/// A uniquely identified message with an ack-tracked recipient list.
///
/// Recipient membership is fixed at construction; only ack flags change,
/// and only from false to true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    owner_id: PeerId,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "PeerId::is_empty")]
    sender_id: PeerId,
}

impl Event {
    /// Persisted, relayed event type.
    pub const PDU: &'static str = "PDU";
    /// Ephemeral event type; sent but never stored or relayed.
    pub const EDU: &'static str = "EDU";

    /// Creates an event with every recipient un-acked.
    ///
    /// Duplicate recipients are collapsed, keeping the first occurrence.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        owner_id: PeerId,
        payload: Value,
        recipients: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        let mut unique: Vec<Recipient> = Vec::new();
        for peer_id in recipients {
            if !unique.iter().any(|r| r.peer_id == peer_id) {
                unique.push(Recipient {
                    peer_id,
                    ack: false,
                });
            }
        }
        Self {
            kind: kind.into(),
            id: id.into(),
            owner_id,
            payload,
            recipients: unique,
            sender_id: PeerId::default(),
        }
    }

    /// Creates a `PDU` event with a random id.
    #[must_use]
    pub fn pdu(
        owner_id: PeerId,
        payload: Value,
        recipients: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self::new(
            Self::PDU,
            uuid::Uuid::new_v4().to_string(),
            owner_id,
            payload,
            recipients,
        )
    }

    /// The event type.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The event id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The peer that created the event.
    #[must_use]
    pub const fn owner_id(&self) -> &PeerId {
        &self.owner_id
    }

    /// The application payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// The peer that transmitted this copy. Empty before the first hop.
    #[must_use]
    pub const fn sender_id(&self) -> &PeerId {
        &self.sender_id
    }

    /// All recipients with their ack flags.
    #[must_use]
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Returns true for `PDU` events.
    #[must_use]
    pub fn is_pdu(&self) -> bool {
        self.kind == Self::PDU
    }

    /// Returns true if `peer` is a recipient and has acked.
    #[must_use]
    pub fn is_acked(&self, peer: &PeerId) -> bool {
        self.recipients
            .iter()
            .any(|r| &r.peer_id == peer && r.ack)
    }

    /// Marks `peer` as acked. Returns true if the flag changed.
    ///
    /// Peers outside the recipient list are ignored.
    pub fn acknowledge(&mut self, peer: &PeerId) -> bool {
        match self.recipients.iter_mut().find(|r| &r.peer_id == peer) {
            Some(recipient) if !recipient.ack => {
                recipient.ack = true;
                true
            }
            _ => false,
        }
    }

    /// Un-acked recipients other than `local`.
    #[must_use]
    pub fn pending(&self, local: &PeerId) -> Vec<PeerId> {
        self.recipients
            .iter()
            .filter(|r| !r.ack && &r.peer_id != local)
            .map(|r| r.peer_id.clone())
            .collect()
    }

    /// Acknowledgment progress across all recipients.
    #[must_use]
    pub fn state(&self) -> DeliveryState {
        let acked = self.recipients.iter().filter(|r| r.ack).count();
        if acked == self.recipients.len() {
            DeliveryState::FullyAcked
        } else if acked == 0 {
            DeliveryState::Unsent
        } else {
            DeliveryState::PartiallyAcked
        }
    }
}

type StoredEvent = Arc<Mutex<Event>>;

struct Shared {
    local: PeerId,
    outbound: Outbound,
    store: Mutex<BoundedMap<String, StoredEvent>>,
    handlers: HandlerRegistry<Event>,
}

impl Shared {
    /// Returns the stored copy of `event`, storing it first if it is new.
    fn get_or_store(&self, event: Event) -> StoredEvent {
        let mut store = self.store.lock();
        if let Some(existing) = store.get(&event.id) {
            return Arc::clone(existing);
        }
        let id = event.id.clone();
        let stored = Arc::new(Mutex::new(event));
        store.insert_if_absent(id, Arc::clone(&stored));
        stored
    }

    /// Acks the local peer and transmits to every pending recipient.
    async fn relay(&self, stored: &StoredEvent) -> Result<Vec<PeerId>, BusError> {
        let outgoing = {
            let mut event = stored.lock();
            event.acknowledge(&self.local);
            event.clone()
        };
        self.transmit(outgoing).await
    }

    async fn transmit(&self, mut event: Event) -> Result<Vec<PeerId>, BusError> {
        let targets = event.pending(&self.local);
        if targets.is_empty() {
            debug!(event_id = %event.id, "no pending recipients");
            return Ok(targets);
        }
        event.sender_id = self.local.clone();
        let payload = encode_record(&self.local, EVENT_KIND, &event)?;
        let sent = self.outbound.send(&payload, &targets).await?;
        debug!(event_id = %event.id, recipients = sent.len(), "event sent");
        Ok(sent)
    }
}

/// Acknowledgment-tracked multicast with store-and-forward relay.
#[derive(Clone)]
pub struct AckedMulticast {
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for AckedMulticast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckedMulticast")
            .field("local", &self.shared.local)
            .field("stored", &self.stored_events())
            .finish_non_exhaustive()
    }
}

enum Receipt {
    Ack { changed: bool },
    New(StoredEvent),
}

impl AckedMulticast {
    /// Handlers invoked once per newly seen `PDU` event.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry<Event> {
        &self.shared.handlers
    }

    /// Sends `event` to its un-acked recipients.
    ///
    /// A new `PDU` is stored first; a `PDU` whose id is already stored is
    /// sent from the stored copy, whose acks reflect what this node knows.
    /// The local peer is always acked. Returns the peers the event was
    /// queued for.
    ///
    /// # Errors
    ///
    /// Returns an encoding error or [`BusError::QueueClosed`].
    pub async fn send(&self, event: Event) -> Result<Vec<PeerId>, BusError> {
        if event.is_pdu() {
            let stored = self.shared.get_or_store(event);
            self.shared.relay(&stored).await
        } else {
            let mut event = event;
            event.acknowledge(&self.shared.local);
            self.shared.transmit(event).await
        }
    }

    /// Snapshot of a stored event.
    #[must_use]
    pub fn event(&self, id: &str) -> Option<Event> {
        let stored = self.shared.store.lock().get(&id.to_string()).cloned();
        stored.map(|event| event.lock().clone())
    }

    /// Acknowledgment progress of a stored event.
    #[must_use]
    pub fn delivery_state(&self, id: &str) -> Option<DeliveryState> {
        self.event(id).map(|event| event.state())
    }

    /// Number of stored events, including expired ones not yet purged.
    #[must_use]
    pub fn stored_events(&self) -> usize {
        self.shared.store.lock().len()
    }

    /// Drops stored events older than the store TTL.
    pub fn purge_expired(&self) -> usize {
        self.shared.store.lock().purge_expired()
    }

    fn receive(&self, event: Event) -> Receipt {
        let mut store = self.shared.store.lock();
        if let Some(existing) = store.get(&event.id) {
            let changed = existing.lock().acknowledge(&event.sender_id);
            return Receipt::Ack { changed };
        }

        let mut event = event;
        let owner = event.owner_id.clone();
        let sender = event.sender_id.clone();
        event.acknowledge(&owner);
        event.acknowledge(&sender);
        event.acknowledge(&self.shared.local);
        let id = event.id.clone();
        let stored = Arc::new(Mutex::new(event));
        store.insert_if_absent(id, Arc::clone(&stored));
        Receipt::New(stored)
    }
}

impl DisseminationPolicy for AckedMulticast {
    fn from_context(context: PolicyContext) -> Self {
        let store = BoundedMap::new(
            context.config.event_store_capacity,
            Some(context.config.event_store_ttl),
        );
        Self {
            shared: Arc::new(Shared {
                local: context.local_peer,
                outbound: context.outbound,
                store: Mutex::new(store),
                handlers: HandlerRegistry::new(),
            }),
            tracker: context.tracker,
        }
    }

    fn name(&self) -> &'static str {
        "acked-multicast"
    }

    fn handle<'a>(&'a self, delivery: Delivery) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            let event: Event = decode_record(&delivery, EVENT_KIND)?;
            if !event.is_pdu() {
                debug!(event_id = %event.id, kind = %event.kind, "ignoring non-PDU event");
                return Ok(());
            }

            let (id, sender) = (event.id.clone(), event.sender_id.clone());
            match self.receive(event) {
                Receipt::Ack { changed } => {
                    debug!(event_id = %id, peer = %sender, changed, "acknowledged");
                }
                Receipt::New(stored) => {
                    let snapshot = stored.lock().clone();
                    debug!(event_id = %id, peer = %sender, "new event");
                    self.shared.handlers.dispatch(&snapshot);

                    let shared = Arc::clone(&self.shared);
                    self.tracker.spawn(async move {
                        if let Err(e) = shared.relay(&stored).await {
                            warn!(event_id = %id, error = %e, "relay failed");
                        }
                    });
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::policy::testing;
    use std::time::Duration;

    fn peers(ids: &[&str]) -> Vec<PeerId> {
        ids.iter().map(|id| PeerId::new(*id)).collect()
    }

    fn e1() -> Event {
        Event::new(
            Event::PDU,
            "e1",
            PeerId::new("a"),
            serde_json::json!({"body": "hello"}),
            peers(&["a", "b", "c"]),
        )
    }

    /// The event as `sender` would put it on the wire.
    fn from_sender(mut event: Event, sender: &str) -> Delivery {
        event.sender_id = PeerId::new(sender);
        let payload = encode_record(&PeerId::new(sender), EVENT_KIND, &event).expect("encode");
        testing::delivery(&payload)
    }

    async fn settle(tracker: &TaskTracker) {
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("relay tasks finish");
    }

    // ==== Event Tests ====

    #[test]
    fn acknowledge_is_monotonic_and_ignores_strangers() {
        let mut event = e1();
        assert_eq!(event.state(), DeliveryState::Unsent);

        assert!(event.acknowledge(&PeerId::new("b")));
        assert!(!event.acknowledge(&PeerId::new("b")));
        assert!(!event.acknowledge(&PeerId::new("zed")));
        assert_eq!(event.state(), DeliveryState::PartiallyAcked);

        event.acknowledge(&PeerId::new("a"));
        event.acknowledge(&PeerId::new("c"));
        assert_eq!(event.state(), DeliveryState::FullyAcked);
        assert_eq!(event.recipients().len(), 3);
    }

    #[test]
    fn duplicate_recipients_collapse() {
        let event = Event::pdu(PeerId::new("a"), Value::Null, peers(&["b", "b", "c"]));
        assert_eq!(event.recipients().len(), 2);
        assert!(!event.id().is_empty());
    }

    #[test]
    fn wire_field_names() {
        let mut event = e1();
        event.acknowledge(&PeerId::new("a"));
        event.sender_id = PeerId::new("a");

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "PDU");
        assert_eq!(json["owner_id"], "a");
        assert_eq!(json["sender_id"], "a");
        assert_eq!(json["recipients"][0], serde_json::json!({"peer_id": "a", "ack": true}));
    }

    // ==== Send Tests ====

    #[tokio::test]
    async fn send_stores_acks_local_and_targets_pending() {
        let (context, _dispatcher) = testing::context("a", BusConfig::default());
        let policy = AckedMulticast::from_context(context);

        let targets = policy.send(e1()).await.expect("send");

        assert_eq!(targets, peers(&["b", "c"]));
        let stored = policy.event("e1").expect("stored");
        assert!(stored.is_acked(&PeerId::new("a")));
        assert!(stored.sender_id().is_empty());
        assert_eq!(policy.delivery_state("e1"), Some(DeliveryState::PartiallyAcked));
    }

    #[tokio::test]
    async fn send_keeps_first_stored_copy() {
        let (context, _dispatcher) = testing::context("a", BusConfig::default());
        let policy = AckedMulticast::from_context(context);
        policy.send(e1()).await.expect("send");

        let rewritten = Event::new(Event::PDU, "e1", PeerId::new("x"), Value::Null, peers(&["d"]));
        let targets = policy.send(rewritten).await.expect("send");

        assert_eq!(targets, peers(&["b", "c"]));
        assert_eq!(policy.event("e1").expect("stored").owner_id(), &PeerId::new("a"));
    }

    #[tokio::test]
    async fn edu_is_sent_but_not_stored() {
        let (context, _dispatcher) = testing::context("a", BusConfig::default());
        let policy = AckedMulticast::from_context(context);
        let edu = Event::new(
            Event::EDU,
            "typing",
            PeerId::new("a"),
            Value::Null,
            peers(&["a", "b"]),
        );

        let targets = policy.send(edu).await.expect("send");

        assert_eq!(targets, peers(&["b"]));
        assert_eq!(policy.stored_events(), 0);
    }

    // ==== Receive Tests ====

    #[tokio::test]
    async fn unknown_event_is_stored_handled_and_relayed() {
        let (context, _dispatcher) = testing::context("b", BusConfig::default());
        let tracker = context.tracker.clone();
        let policy = AckedMulticast::from_context(context);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handled);
        policy.handlers().register(move |event: &Event| {
            sink.lock().push(event.sender_id().clone());
            Ok(())
        });

        policy.handle(from_sender(e1(), "a")).await.expect("handle");
        settle(&tracker).await;

        assert_eq!(*handled.lock(), peers(&["a"]));
        let stored = policy.event("e1").expect("stored");
        assert!(stored.is_acked(&PeerId::new("a")));
        assert!(stored.is_acked(&PeerId::new("b")));
        assert!(!stored.is_acked(&PeerId::new("c")));
        // The relay queued one frame, for c.
        assert_eq!(policy.shared.outbound.stats().enqueued(), 1);
    }

    #[tokio::test]
    async fn known_event_is_an_ack_without_handlers_or_relay() {
        let (context, _dispatcher) = testing::context("a", BusConfig::default());
        let tracker = context.tracker.clone();
        let policy = AckedMulticast::from_context(context);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        policy.handlers().register(move |_| {
            *counter.lock() += 1;
            Ok(())
        });
        policy.send(e1()).await.expect("send");
        let enqueued = policy.shared.outbound.stats().enqueued();

        policy.handle(from_sender(e1(), "b")).await.expect("handle");
        settle(&tracker).await;

        assert_eq!(*calls.lock(), 0);
        assert_eq!(policy.shared.outbound.stats().enqueued(), enqueued);
        let stored = policy.event("e1").expect("stored");
        assert!(stored.is_acked(&PeerId::new("b")));
        assert!(!stored.is_acked(&PeerId::new("c")));
    }

    #[tokio::test]
    async fn non_pdu_receipt_is_ignored() {
        let (context, _dispatcher) = testing::context("b", BusConfig::default());
        let policy = AckedMulticast::from_context(context);
        let edu = Event::new(Event::EDU, "typing", PeerId::new("a"), Value::Null, peers(&["b"]));

        policy.handle(from_sender(edu, "a")).await.expect("handle");

        assert_eq!(policy.stored_events(), 0);
    }

    #[tokio::test]
    async fn foreign_payload_is_a_decode_error() {
        let (context, _dispatcher) = testing::context("b", BusConfig::default());
        let policy = AckedMulticast::from_context(context);
        let delivery = testing::delivery(&crate::codec::Payload::new(
            PeerId::new("a"),
            "chat",
            b"hi".to_vec(),
        ));

        assert!(matches!(policy.handle(delivery).await, Err(BusError::Decode(_))));
    }

    #[tokio::test]
    async fn store_is_bounded() {
        let config = BusConfig::default().with_event_store(2, Duration::from_secs(60));
        let (context, _dispatcher) = testing::context("a", config);
        let policy = AckedMulticast::from_context(context);

        for id in ["e1", "e2", "e3"] {
            let event = Event::new(Event::PDU, id, PeerId::new("a"), Value::Null, peers(&["b"]));
            policy.send(event).await.expect("send");
        }

        assert_eq!(policy.stored_events(), 2);
        assert!(policy.event("e1").is_none());
        assert!(policy.event("e3").is_some());
    }

    // ==== Convergence Tests ====

    struct Node {
        policy: AckedMulticast,
        dispatcher: crate::dispatcher::OutboundDispatcher,
        tracker: TaskTracker,
        handled: Arc<Mutex<usize>>,
    }

    impl Node {
        fn new(id: &str) -> Self {
            let (context, dispatcher) = testing::context(id, BusConfig::default());
            let tracker = context.tracker.clone();
            let policy = AckedMulticast::from_context(context);
            let handled = Arc::new(Mutex::new(0));
            let counter = Arc::clone(&handled);
            policy.handlers().register(move |_| {
                *counter.lock() += 1;
                Ok(())
            });
            Self {
                policy,
                dispatcher,
                tracker,
                handled,
            }
        }

        /// Waits for relays, then drains everything queued as decoded events.
        async fn outbox(&mut self) -> Vec<(PeerId, Delivery, Event)> {
            settle(&self.tracker).await;
            self.tracker.reopen();
            let mut frames = Vec::new();
            while let Some((to, frame)) = self.dispatcher.try_next_frame() {
                let delivery = crate::codec::decode(&frame).expect("decode");
                let event: Event = decode_record(&delivery, EVENT_KIND).expect("event");
                frames.push((to, delivery, event));
            }
            frames
        }

        fn handled(&self) -> usize {
            *self.handled.lock()
        }
    }

    #[tokio::test]
    async fn three_node_convergence() {
        let (mut a, mut b, mut c) = (Node::new("a"), Node::new("b"), Node::new("c"));

        // a sends to b and c.
        a.policy.send(e1()).await.expect("send");
        let from_a = a.outbox().await;
        assert_eq!(from_a.len(), 2);
        for (_, _, event) in &from_a {
            assert_eq!(event.sender_id(), &PeerId::new("a"));
        }
        let (to_b, to_c) = (&from_a[0], &from_a[1]);
        assert_eq!(to_b.0, PeerId::new("b"));
        assert_eq!(to_c.0, PeerId::new("c"));

        // b handles a's copy: acks a and b, relays to c.
        b.policy.handle(to_b.1.clone()).await.expect("handle");
        let from_b = b.outbox().await;
        assert_eq!(from_b.len(), 1);
        let (relay_to, relay, relayed) = &from_b[0];
        assert_eq!(relay_to, &PeerId::new("c"));
        assert_eq!(relayed.sender_id(), &PeerId::new("b"));
        assert!(relayed.is_acked(&PeerId::new("a")));
        assert!(relayed.is_acked(&PeerId::new("b")));
        assert!(!relayed.is_acked(&PeerId::new("c")));

        // c handles a's copy first and relays to b, then sees b's relay as an ack.
        c.policy.handle(to_c.1.clone()).await.expect("handle");
        let from_c = c.outbox().await;
        assert_eq!(from_c.len(), 1);
        assert_eq!(from_c[0].0, PeerId::new("b"));
        c.policy.handle(relay.clone()).await.expect("handle");
        assert!(c.outbox().await.is_empty());

        b.policy.handle(from_c[0].1.clone()).await.expect("handle");
        assert!(b.outbox().await.is_empty());

        assert_eq!((b.handled(), c.handled()), (1, 1));
        assert_eq!(b.policy.delivery_state("e1"), Some(DeliveryState::FullyAcked));
        assert_eq!(c.policy.delivery_state("e1"), Some(DeliveryState::FullyAcked));

        // a gets a relayed copy back: b is acked, nothing more is sent.
        a.policy.handle(relay.clone()).await.expect("handle");
        assert!(a.outbox().await.is_empty());
        assert_eq!(a.handled(), 0);
        let at_a = a.policy.event("e1").expect("stored");
        assert!(at_a.is_acked(&PeerId::new("b")));
        assert!(!at_a.is_acked(&PeerId::new("c")));
    }
}
