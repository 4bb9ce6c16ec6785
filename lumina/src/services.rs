//! The explicit service container: every long-lived component, built once by
//! [`crate::Lifecycle`] and shared as immutable references. There is no
//! global/ambient access anywhere in the runtime.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::chat::{ChatBridge, ChatPipeline};
use crate::consolidation::ConsolidationEngine;
use crate::llm::LlmManager;
use crate::memory::{BatchManager, MemoryStore};
use crate::plugins::PluginRuntime;
use crate::session::SessionManager;
use crate::soul::SoulService;
use crate::ticker::Ticker;

pub struct Services {
    pub config: config::LuminaConfig,
    pub bus: Arc<EventBus>,
    pub memory: Arc<MemoryStore>,
    pub sessions: Arc<SessionManager>,
    pub soul: Arc<SoulService>,
    pub llm: Arc<LlmManager>,
    pub pipeline: Arc<ChatPipeline>,
    pub bridge: Arc<ChatBridge>,
    pub batches: Arc<BatchManager>,
    pub consolidation: Arc<ConsolidationEngine>,
    pub plugins: Arc<PluginRuntime>,
    pub ticker: Arc<Ticker>,
}
