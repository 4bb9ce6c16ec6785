//! Ordered bootstrap and shutdown. Components come up leaves-first (config →
//! storage → bus → soul → llm → chat → consolidation → plugins → ticker) and
//! go down in reverse.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use event_packet::event_type;

use crate::bus::{events, EventBus};
use crate::chat::{
    ChatBridge, ChatPipeline, RagContextProvider, SoulContextProvider, WebSearchProvider,
};
use crate::consolidation::ConsolidationEngine;
use crate::llm::{LlmManager, OpenAiDriver};
use crate::memory::{BatchManager, Embedder, MemoryError, MemoryStore, OpenAIEmbedder};
use crate::plugins::{PluginError, PluginRuntime};
use crate::services::Services;
use crate::session::SessionManager;
use crate::soul::{SoulError, SoulService};
use crate::ticker::Ticker;

/// Database open retries: 5 attempts with exponential backoff from 2 s.
const DB_RETRIES: u32 = 5;
const DB_BACKOFF_BASE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("storage bootstrap failed: {0}")]
    Memory(#[from] MemoryError),
    #[error("soul bootstrap failed: {0}")]
    Soul(#[from] SoulError),
    #[error("plugin bootstrap failed: {0}")]
    Plugin(#[from] PluginError),
    #[error("io error during bootstrap: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Lifecycle;

impl Lifecycle {
    /// Builds and starts every subsystem in dependency order.
    pub async fn start(config: config::LuminaConfig) -> Result<Arc<Services>, LifecycleError> {
        std::fs::create_dir_all(&config.data.data_dir)?;
        std::fs::create_dir_all(config.data.characters_dir())?;
        std::fs::create_dir_all(config.data.plugins_dir())?;
        std::fs::create_dir_all(config.data.sessions_dir())?;

        let bus = Arc::new(EventBus::new());
        events::register_builtin_schemas(&bus);

        let embedder = build_embedder(&config);
        let memory = Arc::new(open_store_with_retry(&config, embedder.clone()).await?);

        let sessions = Arc::new(SessionManager::new(
            config.data.sessions_dir(),
            config.session.max_turns,
        ));

        let soul = Arc::new(SoulService::new(
            config.data.characters_dir(),
            &config.soul,
            Arc::clone(&bus),
        )?);

        let llm = Arc::new(LlmManager::new(&config.llm));
        for (provider_id, provider) in &config.llm.providers {
            llm.register_driver(provider_id, Arc::new(OpenAiDriver::new(provider_id, provider)));
        }

        let pipeline = Arc::new(ChatPipeline::new(Arc::clone(&llm), Some(Arc::clone(&soul))));
        pipeline.register_context_provider(Arc::new(SoulContextProvider::new(Arc::clone(&soul))));
        if let Some(embedder) = embedder.clone() {
            pipeline.register_context_provider(Arc::new(RagContextProvider::new(
                Arc::clone(&memory),
                embedder,
                &config.memory,
            )));
        }
        pipeline.register_tool_provider(Arc::new(WebSearchProvider::new()));

        let bridge = Arc::new(ChatBridge::new(
            Arc::clone(&bus),
            Arc::clone(&pipeline),
            Arc::clone(&sessions),
            Arc::clone(&memory),
            Arc::clone(&soul),
        ));
        bridge.start();

        let batches = Arc::new(BatchManager::new());
        let consolidation = Arc::new(ConsolidationEngine::new(
            Arc::clone(&memory),
            Arc::clone(&llm),
            Arc::clone(&bus),
            Arc::clone(&batches),
            config.consolidation.clone(),
        ));
        consolidation.start();

        soul.start_evolution_schedule(Arc::clone(&llm), Arc::clone(&memory));

        let plugins = Arc::new(PluginRuntime::new(
            config.data.plugins_dir(),
            Arc::clone(&bus),
            Arc::clone(&soul),
            Arc::clone(&memory),
            Arc::clone(&llm),
            config.clone(),
        ));
        // A dependency cycle is a fatal configuration error; individual
        // plugin failures are events, not bootstrap failures.
        plugins.load_all().await?;

        let ticker = Arc::new(Ticker::new(Arc::clone(&bus)));
        ticker.start();

        info!("lumina core started");
        Ok(Arc::new(Services {
            config,
            bus,
            memory,
            sessions,
            soul,
            llm,
            pipeline,
            bridge,
            batches,
            consolidation,
            plugins,
            ticker,
        }))
    }

    /// Stops subsystems in reverse order and announces shutdown on the bus.
    pub async fn shutdown(services: &Services) {
        info!("lumina core shutting down");
        services.ticker.stop();
        services.plugins.unload_all().await;
        services
            .bus
            .emit(
                event_type::SYSTEM_SHUTDOWN,
                serde_json::json!({}),
                "lifecycle",
            )
            .await;
        info!("shutdown complete");
    }
}

async fn open_store_with_retry(
    config: &config::LuminaConfig,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<MemoryStore, MemoryError> {
    let db_path = config.data.db_path();
    let mut backoff = DB_BACKOFF_BASE;
    let mut last_error = None;
    for attempt in 1..=DB_RETRIES {
        match MemoryStore::open(
            &db_path,
            embedder.clone(),
            config.memory.embedding_dimension,
        ) {
            Ok(store) => return Ok(store),
            Err(e) => {
                warn!(attempt, error = %e, "database open failed; retrying");
                last_error = Some(e);
                if attempt < DB_RETRIES {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| MemoryError::Storage("database open failed".to_string())))
}

/// An embedder is available when an OpenAI-compatible provider is configured
/// (explicitly, or via `OPENAI_API_KEY`). Without one, log embeddings are
/// backfilled later and RAG stays off.
fn build_embedder(config: &config::LuminaConfig) -> Option<Arc<dyn Embedder>> {
    if let Some(provider) = config.llm.providers.get("openai") {
        let mut openai_config = async_openai::config::OpenAIConfig::new();
        if let Some(base) = &provider.base_url {
            openai_config = openai_config.with_api_base(base.clone());
        }
        if let Some(key) = &provider.api_key {
            openai_config = openai_config.with_api_key(key.clone());
        }
        return Some(Arc::new(OpenAIEmbedder::with_config(
            openai_config,
            config.memory.embedding_model.clone(),
        )));
    }
    if std::env::var("OPENAI_API_KEY").is_ok() {
        return Some(Arc::new(OpenAIEmbedder::new(
            config.memory.embedding_model.clone(),
        )));
    }
    None
}
