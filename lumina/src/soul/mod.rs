//! Per-character personality: identity config, evolved soul profile, runtime
//! counters, system-prompt rendering, and the scheduled evolution pass.

mod evolution;
mod renderer;
mod store;

pub use evolution::{evolution_prompt, merge_update, parse_trait_update, TraitUpdate};
pub use renderer::PromptTemplate;
pub use store::{
    BigFive, CharacterConfig, CharacterRecord, CharacterStore, Pad, Personality, RuntimeState,
    SoulProfile,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Timelike;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use event_packet::event_type;

use crate::bus::EventBus;
use crate::llm::{collect_text, ChatMessage, LlmError, LlmManager, FEATURE_EVOLUTION};
use crate::memory::MemoryStore;
use crate::normalize_character_id;

/// Built-in system prompt template; a `prompts/system.yaml` under the data
/// dir overrides it.
const DEFAULT_TEMPLATE: &str = include_str!("../../prompts/system.yaml");

const EVOLUTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SoulError {
    #[error("soul io error: {0}")]
    Io(String),
    #[error("soul serialization error: {0}")]
    Serde(String),
    #[error("prompt template error: {0}")]
    Template(String),
    #[error("character '{0}' not found")]
    CharacterNotFound(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Character-scoped personality service: renders the system prompt, applies
/// interaction hooks, and evolves traits on schedule.
///
/// **Interaction**: the chat pipeline's soul context provider calls
/// [`system_prompt`](SoulService::system_prompt); the bridge calls
/// [`on_interaction`](SoulService::on_interaction) after each turn.
pub struct SoulService {
    store: CharacterStore,
    bus: Arc<EventBus>,
    template: PromptTemplate,
    active: RwLock<String>,
    evolution_hour: u32,
    last_evolution_day: Mutex<Option<chrono::NaiveDate>>,
}

impl SoulService {
    pub fn new(
        characters_dir: impl Into<std::path::PathBuf>,
        soul_config: &config::SoulConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self, SoulError> {
        let characters_dir = characters_dir.into();
        let override_path = characters_dir
            .parent()
            .map(|p| p.join("prompts").join("system.yaml"));
        let template_yaml = override_path
            .filter(|p| p.is_file())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let template = PromptTemplate::parse(&template_yaml)?;

        Ok(Self {
            store: CharacterStore::new(characters_dir),
            bus,
            template,
            active: RwLock::new(normalize_character_id(&soul_config.default_character)),
            evolution_hour: soul_config.evolution_hour,
            last_evolution_day: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &CharacterStore {
        &self.store
    }

    pub fn active_character(&self) -> String {
        self.active
            .read()
            .map(|a| a.clone())
            .unwrap_or_else(|_| "default".to_string())
    }

    /// Merged record for the active character.
    pub fn record(&self) -> CharacterRecord {
        self.store.load(&self.active_character())
    }

    /// Current arousal, used to perturb chat temperature.
    pub fn arousal(&self) -> f32 {
        self.record().soul.pad.arousal
    }

    /// Renders the system prompt: static identity plus dynamic state.
    pub fn system_prompt(&self) -> String {
        let record = self.record();
        let vars: HashMap<&str, String> = HashMap::from([
            ("name", record.config.name.clone()),
            ("description", record.config.description.clone()),
            ("custom_prompt", record.config.system_prompt.clone()),
            ("mood", record.soul.current_mood.clone()),
            ("traits", record.soul.personality.traits.join(", ")),
            (
                "relationship_level",
                record.state.relationship_level.to_string(),
            ),
        ]);
        self.template.render(&vars)
    }

    /// Called after each successful chat turn: bumps counters and the
    /// last-interaction timestamp.
    pub async fn on_interaction(&self, _user_input: &str, _ai_response: &str) {
        let character_id = self.active_character();
        let mut state = self.store.load(&character_id).state;
        state.interaction_count += 1;
        state.relationship_level = (state.interaction_count / 10) as u32;
        state.last_interaction = Some(chrono::Utc::now().to_rfc3339());
        if let Err(e) = self.store.save_state(&character_id, &state).await {
            warn!(character_id = %character_id, error = %e, "failed to persist interaction state");
        }
    }

    /// Atomically switches the active character and emits
    /// `character.switched`.
    pub async fn switch_character(&self, character_id: &str) -> Result<(), SoulError> {
        let character_id = normalize_character_id(character_id);
        if !self.store.character_exists(&character_id) {
            return Err(SoulError::CharacterNotFound(character_id));
        }
        if let Ok(mut active) = self.active.write() {
            *active = character_id.clone();
        }
        self.store.invalidate(&character_id);
        info!(character_id = %character_id, "active character switched");
        self.bus
            .emit(
                event_type::CHARACTER_SWITCHED,
                serde_json::json!({ "character_id": character_id }),
                "soul",
            )
            .await;
        Ok(())
    }

    // --- Plugin data delegates (active character scope) ---

    pub fn load_plugin_data(&self, plugin_id: &str) -> Value {
        self.store.load_data(&self.active_character(), plugin_id)
    }

    pub async fn save_plugin_data(&self, plugin_id: &str, data: &Value) -> Result<(), SoulError> {
        self.store
            .save_data(&self.active_character(), plugin_id, data)
            .await
    }

    pub fn plugin_data_dir(&self, plugin_id: &str) -> Result<std::path::PathBuf, SoulError> {
        self.store.data_dir(&self.active_character(), plugin_id)
    }

    /// Runs one evolution pass now: recent memories → trait-update JSON →
    /// non-destructive merge into the soul profile.
    pub async fn run_evolution(
        &self,
        llm: &LlmManager,
        memory: &MemoryStore,
    ) -> Result<(), SoulError> {
        let character_id = self.active_character();
        let record = self.store.load(&character_id);
        let memories: Vec<String> = memory
            .recent_episodic(&character_id, 20)
            .await
            .map_err(|e| SoulError::Io(e.to_string()))?
            .into_iter()
            .map(|hit| hit.content)
            .collect();

        let prompt = evolution_prompt(&record.config.name, &memories);
        let driver = llm.driver(FEATURE_EVOLUTION)?;
        let request = llm.request_for(
            FEATURE_EVOLUTION,
            vec![ChatMessage::user(prompt)],
            None,
        )?;
        let stream = tokio::time::timeout(EVOLUTION_TIMEOUT, driver.chat_completion(request))
            .await
            .map_err(|_| LlmError::Timeout(EVOLUTION_TIMEOUT))??;
        let raw = tokio::time::timeout(EVOLUTION_TIMEOUT, collect_text(stream))
            .await
            .map_err(|_| LlmError::Timeout(EVOLUTION_TIMEOUT))??;

        let update = match parse_trait_update(&raw) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, raw = %raw, "evolution JSON parse failed; pass skipped");
                return Ok(());
            }
        };

        let mut soul = record.soul;
        merge_update(&mut soul, update);
        self.store.save_soul(&character_id, &soul).await?;
        info!(character_id = %character_id, traits = soul.personality.traits.len(), "soul evolved");
        Ok(())
    }

    /// Subscribes the scheduled evolution pass to minute ticks: it runs once
    /// per day at the configured local hour.
    pub fn start_evolution_schedule(
        self: &Arc<Self>,
        llm: Arc<LlmManager>,
        memory: Arc<MemoryStore>,
    ) {
        let soul = Arc::clone(self);
        self.bus
            .subscribe_fn(event_type::SYSTEM_TICK_MINUTE, move |_event| {
                let soul = Arc::clone(&soul);
                let llm = Arc::clone(&llm);
                let memory = Arc::clone(&memory);
                async move {
                    let now = chrono::Local::now();
                    if now.hour() != soul.evolution_hour {
                        return Ok(());
                    }
                    let today = now.date_naive();
                    {
                        let mut last = soul
                            .last_evolution_day
                            .lock()
                            .map_err(|e| e.to_string())?;
                        if *last == Some(today) {
                            return Ok(());
                        }
                        *last = Some(today);
                    }
                    if let Err(e) = soul.run_evolution(&llm, &memory).await {
                        error!(error = %e, "scheduled evolution pass failed");
                    }
                    Ok(())
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> SoulService {
        SoulService::new(
            dir.join("characters"),
            &config::SoulConfig::default(),
            Arc::new(EventBus::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn system_prompt_includes_identity_and_mood() {
        let dir = tempfile::tempdir().unwrap();
        let soul = service(dir.path());

        let config = CharacterConfig {
            name: "Hiyori".to_string(),
            description: "a gentle companion".to_string(),
            system_prompt: "Likes rainy days.".to_string(),
            extra: HashMap::new(),
        };
        soul.store().save_config("hiyori", &config).await.unwrap();

        let prompt = soul.system_prompt();
        assert!(prompt.contains("You are Hiyori."));
        assert!(prompt.contains("a gentle companion"));
        assert!(prompt.contains("Current mood: neutral"));
    }

    #[tokio::test]
    async fn interaction_hook_bumps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let soul = service(dir.path());
        for _ in 0..10 {
            soul.on_interaction("hi", "hello").await;
        }
        let state = soul.record().state;
        assert_eq!(state.interaction_count, 10);
        assert_eq!(state.relationship_level, 1);
        assert!(state.last_interaction.is_some());
    }

    #[tokio::test]
    async fn switch_to_missing_character_fails() {
        let dir = tempfile::tempdir().unwrap();
        let soul = service(dir.path());
        assert!(matches!(
            soul.switch_character("ghost").await,
            Err(SoulError::CharacterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn switch_character_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("characters").join("alice")).unwrap();

        let bus = Arc::new(EventBus::new());
        crate::bus::events::register_builtin_schemas(&bus);
        let soul = SoulService::new(
            dir.path().join("characters"),
            &config::SoulConfig::default(),
            Arc::clone(&bus),
        )
        .unwrap();

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe_fn(event_type::CHARACTER_SWITCHED, move |event| {
            let seen = Arc::clone(&seen_clone);
            async move {
                assert_eq!(event.data["character_id"], "alice");
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });

        soul.switch_character("Alice").await.unwrap();
        assert_eq!(soul.active_character(), "alice");
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
