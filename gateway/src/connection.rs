//! WebSocket connection lifecycle: recv loop, packet normalization, and
//! republication onto the bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use event_packet::{event_type, EventPacket};

use super::state::GatewayState;

/// Identical (session_id, text) inputs inside this window are dropped.
const DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Inbound packet types republished on the bus.
const INBOUND_TYPES: &[&str] = &[
    event_type::INPUT_TEXT,
    event_type::INPUT_AUDIO,
    event_type::CONTROL_INTERRUPT,
    event_type::CONTROL_SESSION,
];

pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = state.register_client(tx.clone());
    let session_id = state.next_session_id();
    info!(client_id, session_id, "websocket client connected");

    // Writer task: everything leaving this socket goes through one channel.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Fresh session announcement.
    let ready = EventPacket::new(
        session_id,
        event_type::SYSTEM_READY,
        "gateway",
        json!({ "status": "connected", "session_id": session_id }),
    );
    if let Ok(text) = serde_json::to_string(&ready) {
        let _ = tx.send(Message::Text(text));
    }

    let mut last_input: Option<(String, Instant)> = None;

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                warn!(client_id, error = %e, "read error (client closed?)");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };

        // Raw heartbeat, outside the packet framing.
        if text == "ping" {
            let _ = tx.send(Message::Text("pong".to_string()));
            continue;
        }

        let mut packet: EventPacket = match serde_json::from_str(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(client_id, error = %e, "invalid packet JSON; ignored");
                continue;
            }
        };

        // Legacy alias used by older clients.
        if packet.packet_type == "chat" {
            packet.packet_type = event_type::INPUT_TEXT.to_string();
        }

        if packet.packet_type == event_type::INPUT_TEXT {
            let signature = format!(
                "{}:{}",
                packet.session_id,
                packet.payload_str("text").unwrap_or_default()
            );
            let now = Instant::now();
            if let Some((last_signature, at)) = &last_input {
                if *last_signature == signature && now.duration_since(*at) < DEDUP_WINDOW {
                    warn!(client_id, "duplicate input_text dropped");
                    continue;
                }
            }
            last_input = Some((signature, now));
        }

        if INBOUND_TYPES.contains(&packet.packet_type.as_str()) {
            let packet_type = packet.packet_type.clone();
            let data = serde_json::to_value(&packet).unwrap_or(serde_json::Value::Null);
            debug!(client_id, packet_type = %packet_type, "inbound packet republished");
            state.bus().emit(&packet_type, data, "frontend").await;
        } else {
            // Unknown packet types are echoed back as a status error.
            let echo = EventPacket::new(
                packet.session_id,
                event_type::SYSTEM_STATUS,
                "gateway",
                json!({ "error": "unknown_type", "received": packet.packet_type }),
            );
            if let Ok(text) = serde_json::to_string(&echo) {
                let _ = tx.send(Message::Text(text));
            }
        }
    }

    state.remove_client(client_id);
    writer.abort();
    info!(client_id, "websocket client disconnected");
}
