//! # molt-bus
//!
//! Message dissemination layer for MOLT peers.
//!
//! Given a [`Transport`] that can open byte streams between peers, this
//! crate delivers content-hashed, optionally signed messages to named
//! recipients. Each protocol id runs one [`DisseminationPolicy`]:
//!
//! - [`DirectDelivery`]: every verified message goes to the handlers
//! - [`AckedMulticast`]: per-recipient acks with store-and-forward relay
//! - [`FloodGossip`]: duplicate suppression by id, relay left to handlers
//!
//! ## Core Types
//!
//! - [`Envelope`]: wire frame carrying a serialized [`Message`] and its SHA3-256 hash
//! - [`ConnectionCache`]: one reusable outbound stream per peer
//! - [`Outbound`]: bounded send queue with backpressure and bounded retry
//! - [`InboundProcessor`]: per-stream read loop feeding the policy
//! - [`MessageBus`]: wires the above together for one protocol
//! - [`MemoryNetwork`]: in-process transport for tests and demos

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bounded;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod inbound;
pub mod memory;
pub mod policy;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use bounded::BoundedMap;
pub use bus::{DirectBus, GossipBus, MessageBus, MessageBusBuilder, MulticastBus};
pub use codec::{ContentHash, Delivery, Envelope, FRAME_DELIMITER, Message, Payload, decode, encode};
pub use config::{BusConfig, RetryPolicy};
pub use connection::{ConnectionCache, PeerStream};
pub use dispatcher::{DispatcherStats, Outbound, OutboundDispatcher};
pub use error::BusError;
pub use handlers::{Handler, HandlerRegistry};
pub use identity::{Ed25519Signer, Ed25519Verifier, Signer, Verifier};
pub use inbound::{InboundProcessor, InboundStats, StreamEnd};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use policy::{
    AckedMulticast, DeliveryState, DirectDelivery, DisseminationPolicy, EVENT_KIND, Event,
    FloodGossip, GOSSIP_KIND, GossipEvent, JSON_CODEC, PolicyContext, Recipient,
};
pub use protocol::{PeerId, ProtocolId};
pub use telemetry::{
    MESSAGE_DROPPED, MESSAGE_RECEIVED, MESSAGE_SENT, NoopTelemetry, Telemetry, TelemetryFields,
    TracingTelemetry,
};
pub use transport::{BoxFuture, BoxedStream, ByteStream, StreamHandler, Transport, parse_address};
