//! Event type vocabulary shared by the gateway and the core.

// Input (source: frontend / hardware)
pub const INPUT_TEXT: &str = "input_text";
pub const INPUT_AUDIO: &str = "input_audio";

// Brain (source: chat pipeline)
pub const BRAIN_THINKING: &str = "brain_thinking";
pub const BRAIN_RESPONSE: &str = "brain_response";
pub const BRAIN_RESPONSE_END: &str = "brain_response_end";
pub const BRAIN_TOOL_CALL: &str = "brain_tool_call";

// Control (source: system)
pub const CONTROL_INTERRUPT: &str = "control_interrupt";
pub const CONTROL_SESSION: &str = "control_session";
pub const SYSTEM_STATUS: &str = "system_status";
pub const SYSTEM_READY: &str = "system.ready";
pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
pub const SYSTEM_TICK: &str = "system.tick";
pub const SYSTEM_TICK_MINUTE: &str = "system.tick.minute";
pub const COGNITIVE_STATE: &str = "cognitive_state";
pub const EMOTION_CHANGED: &str = "emotion:changed";

// Plugin lifecycle
pub const PLUGIN_LOADED: &str = "plugin.loaded";
pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
pub const PLUGIN_ERROR: &str = "plugin.error";
pub const REGISTER_ROUTER: &str = "core.register_router";
pub const SERVICE_REGISTERED: &str = "service.registered";
pub const SERVICE_UNREGISTERED: &str = "service.unregistered";

// Memory / soul
pub const CONSOLIDATION_COMPLETED: &str = "consolidation.completed";
pub const CHARACTER_SWITCHED: &str = "character.switched";

/// Event types the gateway forwards to connected WebSocket clients.
pub const OUTBOUND_WHITELIST: &[&str] = &[
    BRAIN_THINKING,
    BRAIN_RESPONSE,
    BRAIN_RESPONSE_END,
    COGNITIVE_STATE,
    SYSTEM_STATUS,
    CONTROL_SESSION,
    EMOTION_CHANGED,
];
