//! Bridges EventBus `input_text` to the chat pipeline: assembles history,
//! streams `brain_response` tokens back onto the bus, and persists the turn.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use event_packet::{event_type, EventPacket};

use crate::bus::events::InputTextPayload;
use crate::bus::{Event, EventBus};
use crate::llm::{ChatMessage, ChatRole};
use crate::memory::MemoryStore;
use crate::session::SessionManager;
use crate::soul::SoulService;

use super::{ChatPipeline, ChatRequestSpec, PipelineError};

/// Most recent history turns included in the prompt.
const HISTORY_WINDOW: usize = 10;

/// Response sent when the LLM cannot be reached; followed by a normal end
/// marker so the client treats it like any reply.
const FALLBACK_RESPONSE: &str =
    "Sorry, I lost my train of thought for a moment. Could you say that again?";

struct InFlight {
    session_id: u64,
    cancel: CancellationToken,
}

/// Core service bridging `input_text` events to the pipeline. One in-flight
/// request at a time; newer input or an explicit interrupt cancels it.
pub struct ChatBridge {
    bus: Arc<EventBus>,
    pipeline: Arc<ChatPipeline>,
    sessions: Arc<SessionManager>,
    memory: Arc<MemoryStore>,
    soul: Arc<SoulService>,
    in_flight: Mutex<Option<InFlight>>,
}

impl ChatBridge {
    pub fn new(
        bus: Arc<EventBus>,
        pipeline: Arc<ChatPipeline>,
        sessions: Arc<SessionManager>,
        memory: Arc<MemoryStore>,
        soul: Arc<SoulService>,
    ) -> Self {
        Self {
            bus,
            pipeline,
            sessions,
            memory,
            soul,
            in_flight: Mutex::new(None),
        }
    }

    /// Subscribes to `input_text` and `control_interrupt`.
    pub fn start(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        self.bus.subscribe_fn(event_type::INPUT_TEXT, move |event| {
            let bridge = Arc::clone(&bridge);
            async move {
                bridge.handle_input_text(event);
                Ok(())
            }
        });

        let bridge = Arc::clone(self);
        self.bus
            .subscribe_fn(event_type::CONTROL_INTERRUPT, move |_event| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge.interrupt();
                    Ok(())
                }
            });
        info!("chat bridge started (listening to input_text)");
    }

    /// Cancels the in-flight request, if any.
    pub fn interrupt(&self) {
        if let Ok(mut guard) = self.in_flight.lock() {
            if let Some(in_flight) = guard.take() {
                info!(session_id = in_flight.session_id, "interrupting in-flight chat task");
                in_flight.cancel.cancel();
            }
        }
    }

    fn handle_input_text(self: &Arc<Self>, event: Event) {
        let packet: EventPacket = match serde_json::from_value(event.data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "input_text event without packet shape; ignored");
                return;
            }
        };
        let payload: InputTextPayload = match serde_json::from_value(packet.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "input_text payload malformed; ignored");
                return;
            }
        };
        if payload.text.is_empty() {
            return;
        }

        // Newer input takes over: cancel whatever is running.
        self.interrupt();

        let cancel = CancellationToken::new();
        if let Ok(mut guard) = self.in_flight.lock() {
            *guard = Some(InFlight {
                session_id: packet.session_id,
                cancel: cancel.clone(),
            });
        }

        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            bridge.process_chat(packet, payload, cancel).await;
        });
    }

    async fn emit_packet(&self, session_id: u64, packet_type: &str, payload: serde_json::Value) {
        let packet = EventPacket::new(session_id, packet_type, "core.chat_bridge", payload);
        let data = serde_json::to_value(&packet).unwrap_or(serde_json::Value::Null);
        self.bus.emit(packet_type, data, "core.chat_bridge").await;
    }

    async fn process_chat(
        &self,
        packet: EventPacket,
        payload: InputTextPayload,
        cancel: CancellationToken,
    ) {
        let session_id = packet.session_id;
        let character_id = payload.character_id.clone();
        let user_id = payload.user_id.clone();
        let text = payload.text.clone();

        self.emit_packet(
            session_id,
            event_type::BRAIN_THINKING,
            json!({ "mode": "chat", "text": text }),
        )
        .await;

        // Short-term history window plus the new user message.
        let mut messages: Vec<ChatMessage> = self
            .sessions
            .history(&user_id, &character_id)
            .into_iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|turn| ChatMessage {
                role: if turn.role == "assistant" {
                    ChatRole::Assistant
                } else {
                    ChatRole::User
                },
                content: turn.content,
                tool_calls: Vec::new(),
                tool_call_id: None,
            })
            .collect();
        messages.push(ChatMessage::user(text.clone()));

        let mut spec = ChatRequestSpec::new(messages, &user_id, &character_id);
        spec.model = payload.model.clone();

        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let forward_bus = Arc::clone(&self.bus);
        let forward = tokio::spawn(async move {
            while let Some(token) = token_rx.recv().await {
                let packet = EventPacket::new(
                    session_id,
                    event_type::BRAIN_RESPONSE,
                    "core.chat_bridge",
                    json!({ "content": token }),
                );
                let data = serde_json::to_value(&packet).unwrap_or(serde_json::Value::Null);
                forward_bus
                    .emit(event_type::BRAIN_RESPONSE, data, "core.chat_bridge")
                    .await;
            }
        });

        let result = self.pipeline.run(spec, token_tx, cancel).await;
        let _ = forward.await;

        match result {
            Ok(response) => {
                self.emit_packet(session_id, event_type::BRAIN_RESPONSE_END, json!({}))
                    .await;

                if let Err(e) = self.sessions.add_turn(&user_id, &character_id, &text, &response) {
                    error!(error = %e, "failed to persist session turn");
                }

                let user_label = payload.user_name.as_deref().unwrap_or(&user_id);
                let narrative = format!("{user_label}: {text}\n{character_id}: {response}");
                if let Err(e) = self.memory.log_conversation(&character_id, &narrative).await {
                    error!(error = %e, "failed to log conversation");
                } else {
                    debug!(character_id = %character_id, "conversation logged");
                }

                self.soul.on_interaction(&text, &response).await;
            }
            Err(PipelineError::Cancelled) => {
                info!(session_id, "chat task cancelled by user interrupt");
            }
            Err(e) => {
                error!(error = %e, "chat processing failed; sending fallback");
                self.emit_packet(
                    session_id,
                    event_type::BRAIN_RESPONSE,
                    json!({ "content": FALLBACK_RESPONSE }),
                )
                .await;
                self.emit_packet(session_id, event_type::BRAIN_RESPONSE_END, json!({}))
                    .await;
            }
        }

        // Clear the slot only if it is still ours.
        if let Ok(mut guard) = self.in_flight.lock() {
            if guard.as_ref().map(|f| f.session_id) == Some(session_id) {
                *guard = None;
            }
        }
    }
}
