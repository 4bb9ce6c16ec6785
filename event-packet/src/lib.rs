//! Wire protocol for the Lumina gateway and event bus: one packet shape for
//! every message crossing the WebSocket, plus the event type vocabulary.
//!
//! This crate does not depend on lumina. The gateway frames WebSocket JSON
//! into [`EventPacket`]; the core wraps bus payloads into packets on the way
//! back out.

pub mod event_type;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard data unit for the gateway and the event bus.
///
/// `session_id` is the global interaction version used for interrupt logic:
/// a packet carrying a lower session id than the current one is stale and
/// downstream consumers discard it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventPacket {
    /// Correlation id for tracing one request across components.
    #[serde(default = "new_trace_id")]
    pub trace_id: String,
    /// Monotonic per-connection interaction version.
    pub session_id: u64,
    /// Event type string, usually one of [`event_type`].
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Component or plugin id that produced the packet.
    pub source: String,
    #[serde(default)]
    pub payload: Value,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub timestamp: f64,
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl EventPacket {
    /// Builds a packet with a fresh trace id and the current timestamp.
    pub fn new(
        session_id: u64,
        packet_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            trace_id: new_trace_id(),
            session_id,
            packet_type: packet_type.into(),
            source: source.into(),
            payload,
            timestamp: unix_now(),
        }
    }

    /// Reads a string field out of the payload object, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
