//! Built-in event payload types and their schema registration.
//!
//! Packet-borne events (gateway traffic) carry a full [`EventPacket`] as bus
//! data; core-emitted events carry the bare payload object. The schema for
//! each type matches whichever shape that type carries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use event_packet::event_type;

use super::{EventBus, EventSchema};

/// `input_text` payload inside the gateway packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputTextPayload {
    pub text: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_character_id")]
    pub character_id: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Display label used when logging the narrative; falls back to user_id.
    #[serde(default)]
    pub user_name: Option<String>,
}

fn default_user_id() -> String {
    "default_user".to_string()
}

fn default_character_id() -> String {
    "default_char".to_string()
}

/// The packet wrapper validated for `input_text` (unknown envelope fields pass
/// through).
#[derive(Debug, Deserialize)]
pub struct InputTextEvent {
    #[allow(dead_code)]
    pub session_id: u64,
    pub payload: InputTextPayload,
}

#[derive(Debug, Deserialize)]
pub struct BrainResponseEvent {
    #[allow(dead_code)]
    pub session_id: u64,
    pub payload: BrainResponsePayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrainResponsePayload {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct BrainResponseEndEvent {
    #[allow(dead_code)]
    pub session_id: u64,
    #[serde(default)]
    #[allow(dead_code)]
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginLifecyclePayload {
    pub plugin_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsolidationCompletedPayload {
    pub character_id: String,
    pub facts_added: u32,
    pub insights_added: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CharacterSwitchedPayload {
    pub character_id: String,
}

/// Registers the built-in schemas. Called once during bootstrap.
pub fn register_builtin_schemas(bus: &EventBus) {
    bus.register_schema(
        event_type::INPUT_TEXT,
        EventSchema::of::<InputTextEvent>("1.0").with_description("user text input packet"),
    );
    bus.register_schema(
        event_type::BRAIN_RESPONSE,
        EventSchema::of::<BrainResponseEvent>("1.0").with_description("streamed response token"),
    );
    bus.register_schema(
        event_type::BRAIN_RESPONSE_END,
        EventSchema::of::<BrainResponseEndEvent>("1.0").with_description("end of streamed response"),
    );
    bus.register_schema(
        event_type::PLUGIN_LOADED,
        EventSchema::of::<PluginLifecyclePayload>("1.0"),
    );
    bus.register_schema(
        event_type::PLUGIN_UNLOADED,
        EventSchema::of::<PluginLifecyclePayload>("1.0"),
    );
    bus.register_schema(
        event_type::PLUGIN_ERROR,
        EventSchema::of::<PluginLifecyclePayload>("1.0"),
    );
    bus.register_schema(
        event_type::CONSOLIDATION_COMPLETED,
        EventSchema::of::<ConsolidationCompletedPayload>("1.0"),
    );
    bus.register_schema(
        event_type::CHARACTER_SWITCHED,
        EventSchema::of::<CharacterSwitchedPayload>("1.0"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_text_payload_defaults() {
        let payload: InputTextPayload = serde_json::from_value(serde_json::json!({
            "text": "hi"
        }))
        .unwrap();
        assert_eq!(payload.user_id, "default_user");
        assert_eq!(payload.character_id, "default_char");
        assert!(payload.model.is_none());
    }

    #[tokio::test]
    async fn builtin_schemas_reject_malformed_packets() {
        let bus = std::sync::Arc::new(EventBus::new());
        register_builtin_schemas(&bus);
        bus.subscribe_fn(event_type::INPUT_TEXT, |_| async { Ok(()) });

        // Packet missing `text` in payload fails validation.
        let dropped = bus
            .emit(
                event_type::INPUT_TEXT,
                serde_json::json!({"session_id": 1, "payload": {}}),
                "test",
            )
            .await;
        assert_eq!(dropped, 0);

        let ok = bus
            .emit(
                event_type::INPUT_TEXT,
                serde_json::json!({"session_id": 1, "payload": {"text": "hello"}}),
                "test",
            )
            .await;
        assert_eq!(ok, 1);
    }
}
