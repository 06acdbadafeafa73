//! Best-effort observability hooks fired on send and receive.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Fields attached to a telemetry event.
pub type TelemetryFields = BTreeMap<String, Value>;

/// Event published after every transmission attempt.
pub const MESSAGE_SENT: &str = "messaging:message:sent";
/// Event published for every frame read; frames that were not delivered
/// carry an `error` field.
pub const MESSAGE_RECEIVED: &str = "messaging:message:received";
/// Event published when an item is dropped after exhausting its retries.
pub const MESSAGE_DROPPED: &str = "messaging:message:dropped";

/// Sink for telemetry events.
///
/// Implementations must not block and cannot fail; delivery never depends
/// on telemetry.
pub trait Telemetry: Send + Sync + fmt::Debug {
    /// Publishes one event.
    fn publish(&self, event: &str, fields: &TelemetryFields);
}

/// Emits telemetry as `tracing` debug events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn publish(&self, event: &str, fields: &TelemetryFields) {
        tracing::debug!(target: "molt_bus::telemetry", event, ?fields, "telemetry");
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn publish(&self, _event: &str, _fields: &TelemetryFields) {}
}

/// Builds a field map from `(name, value)` pairs.
pub(crate) fn fields<const N: usize>(pairs: [(&str, Value); N]) -> TelemetryFields {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
