//! Shared gateway state: the session counter, the open-socket registry, and
//! the bus subscription that fans outbound events out to clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use event_packet::{event_type, EventPacket};
use lumina::bus::EventBus;

pub struct GatewayState {
    bus: Arc<EventBus>,
    session_counter: AtomicU64,
    client_counter: AtomicU64,
    clients: DashMap<u64, mpsc::UnboundedSender<Message>>,
}

impl GatewayState {
    /// Builds the state and subscribes the outbound forwarder to every
    /// whitelisted event type.
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let state = Arc::new(Self {
            bus,
            session_counter: AtomicU64::new(0),
            client_counter: AtomicU64::new(0),
            clients: DashMap::new(),
        });

        for outbound_type in event_type::OUTBOUND_WHITELIST {
            let forward = Arc::clone(&state);
            state.bus.subscribe_fn(outbound_type, move |event| {
                let forward = Arc::clone(&forward);
                async move {
                    forward.broadcast(&event.event_type, &event.source, event.data);
                    Ok(())
                }
            });
        }
        state
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Fresh monotonic session id for a new connection.
    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register_client(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let client_id = self.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.clients.insert(client_id, sender);
        client_id
    }

    pub fn remove_client(&self, client_id: u64) {
        self.clients.remove(&client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Serializes an event for the wire and sends it to every open socket.
    /// Bus data is either a full packet (bridge traffic) or a bare payload
    /// that gets wrapped.
    fn broadcast(&self, event_type: &str, source: &str, data: Value) {
        let packet_value = if data.get("payload").is_some() && data.get("session_id").is_some() {
            data
        } else {
            let session_id = data
                .get("session_id")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            serde_json::to_value(EventPacket::new(session_id, event_type, source, data))
                .unwrap_or(Value::Null)
        };
        let Ok(text) = serde_json::to_string(&packet_value) else {
            return;
        };

        let mut dead: Vec<u64> = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(Message::Text(text.clone())).is_err() {
                dead.push(*entry.key());
            }
        }
        for client_id in dead {
            warn!(client_id, "dropping dead websocket client");
            self.clients.remove(&client_id);
        }
        debug!(event_type, clients = self.clients.len(), "broadcast");
    }
}
