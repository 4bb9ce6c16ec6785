//! # Lumina
//!
//! A personal AI companion runtime: a long-running local service that receives
//! user input, builds context from a persistent memory graph, invokes a
//! language-model backend, streams the reply, and updates the agent's evolving
//! personality.
//!
//! ## Design principles
//!
//! - **Everything over the bus**: components that are not wired at startup
//!   communicate only through the [`EventBus`] (typed payloads, wildcard
//!   subscriptions, service registry).
//! - **Explicit services, no globals**: the [`Services`] struct is built once
//!   by [`Lifecycle`] and shared as immutable `Arc` references.
//! - **Character-scoped state**: memory rows, soul files, and sessions are all
//!   keyed by a lowercased character id.
//!
//! ## Main modules
//!
//! - [`bus`]: [`EventBus`] — pub/sub with schema validation and services.
//! - [`memory`]: [`MemoryStore`] — SQLite vector + full-text hybrid search,
//!   conversation log, knowledge facts, insights; [`Embedder`] trait.
//! - [`soul`]: [`SoulService`] — per-character personality, prompt rendering,
//!   scheduled evolution.
//! - [`llm`]: [`LlmDriver`] streaming trait, [`LlmManager`] feature routes,
//!   [`OpenAiDriver`], [`MockDriver`].
//! - [`chat`]: [`ChatPipeline`] (context providers → tool prep → streaming
//!   execution with tool-call loop) and [`ChatBridge`].
//! - [`consolidation`]: [`ConsolidationEngine`] — background distillation of
//!   conversation logs into facts, insights, and episodic memory.
//! - [`plugins`]: [`PluginRuntime`] — manifest discovery, dependency order,
//!   permission-gated contexts, local and process isolation.
//! - [`ticker`]: the single global [`Ticker`] emitting `system.tick` events.
//! - [`lifecycle`]: ordered bootstrap and shutdown.

pub mod bus;
pub mod chat;
pub mod consolidation;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod plugins;
pub mod services;
pub mod session;
pub mod soul;
pub mod ticker;

pub use bus::{Event, EventBus, EventSchema, SubscriptionId};
pub use chat::{ChatBridge, ChatPipeline, ContextProvider, ToolProvider};
pub use consolidation::ConsolidationEngine;
pub use lifecycle::Lifecycle;
pub use llm::{LlmDriver, LlmManager, MockDriver, OpenAiDriver};
pub use memory::{Embedder, MemoryStore};
pub use plugins::PluginRuntime;
pub use services::Services;
pub use session::SessionManager;
pub use soul::SoulService;
pub use ticker::Ticker;

/// Lowercases a character id at the boundary. All per-character tables and
/// directories use the normalized form.
pub fn normalize_character_id(id: &str) -> String {
    id.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_ids_are_lowercased_and_trimmed() {
        assert_eq!(normalize_character_id("Alice"), "alice");
        assert_eq!(normalize_character_id("  HIYORI "), "hiyori");
    }
}
