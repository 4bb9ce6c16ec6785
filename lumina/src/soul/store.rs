//! On-disk character state: the `config.json` / `soul.json` / `state.json`
//! triple under `<data>/characters/<id>/`, plus per-plugin data files.
//!
//! The triple is logically one document; readers get a consistent merged
//! [`CharacterRecord`] from an in-memory cache invalidated on write. All
//! writes are atomic (tmp-then-rename) and serialized per character id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::normalize_character_id;

use super::SoulError;

/// User-authored character settings (`config.json`). Unknown keys are kept
/// and written back untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CharacterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Big-Five-style personality vector, each axis in [0, 1].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BigFive {
    pub openness: f32,
    pub conscientiousness: f32,
    pub extraversion: f32,
    pub agreeableness: f32,
    pub neuroticism: f32,
}

impl Default for BigFive {
    fn default() -> Self {
        Self {
            openness: 0.5,
            conscientiousness: 0.5,
            extraversion: 0.5,
            agreeableness: 0.5,
            neuroticism: 0.5,
        }
    }
}

/// Pleasure-arousal-dominance mood vector, each axis in [-1, 1].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Pad {
    pub pleasure: f32,
    pub arousal: f32,
    pub dominance: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Personality {
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub big_five: BigFive,
}

/// AI-evolved personality state (`soul.json`). Only the evolution pass and
/// interaction hooks write it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SoulProfile {
    #[serde(default)]
    pub personality: Personality,
    #[serde(default = "default_mood")]
    pub current_mood: String,
    #[serde(default)]
    pub pad: Pad,
    #[serde(default)]
    pub last_updated: Option<String>,
}

fn default_mood() -> String {
    "neutral".to_string()
}

impl Default for SoulProfile {
    fn default() -> Self {
        Self {
            personality: Personality::default(),
            current_mood: default_mood(),
            pad: Pad::default(),
            last_updated: None,
        }
    }
}

/// Runtime counters (`state.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub relationship_level: u32,
    #[serde(default = "default_energy")]
    pub energy: f32,
    #[serde(default)]
    pub interaction_count: u64,
    #[serde(default)]
    pub last_interaction: Option<String>,
}

fn default_energy() -> f32 {
    1.0
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            relationship_level: 0,
            energy: default_energy(),
            interaction_count: 0,
            last_interaction: None,
        }
    }
}

/// The merged view of one character's three files.
#[derive(Clone, Debug, Default)]
pub struct CharacterRecord {
    pub config: CharacterConfig,
    pub soul: SoulProfile,
    pub state: RuntimeState,
}

/// Owns the character directories; the sole writer of soul state on disk.
pub struct CharacterStore {
    root: PathBuf,
    cache: DashMap<String, CharacterRecord>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CharacterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
            write_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn character_dir(&self, character_id: &str) -> PathBuf {
        self.root.join(normalize_character_id(character_id))
    }

    pub fn character_exists(&self, character_id: &str) -> bool {
        self.character_dir(character_id).is_dir()
    }

    fn write_lock(&self, character_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(normalize_character_id(character_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
        if !path.is_file() {
            return T::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "malformed character file; using defaults");
                T::default()
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable character file; using defaults");
                T::default()
            }
        }
    }

    /// Atomic write: serialize to `<file>.tmp` in the same directory, then
    /// rename over the target. A crash mid-write never leaves a partial file
    /// at the target path.
    fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<(), SoulError> {
        let parent = path
            .parent()
            .ok_or_else(|| SoulError::Io(format!("no parent dir for {}", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| SoulError::Io(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        let content =
            serde_json::to_vec_pretty(value).map_err(|e| SoulError::Serde(e.to_string()))?;
        std::fs::write(&tmp, content).map_err(|e| SoulError::Io(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| SoulError::Io(e.to_string()))?;
        Ok(())
    }

    /// Loads (or creates in memory) a character's merged record.
    pub fn load(&self, character_id: &str) -> CharacterRecord {
        let character_id = normalize_character_id(character_id);
        if let Some(cached) = self.cache.get(&character_id) {
            return cached.clone();
        }
        let dir = self.character_dir(&character_id);
        let mut record = CharacterRecord {
            config: Self::read_json(&dir.join("config.json")),
            soul: Self::read_json(&dir.join("soul.json")),
            state: Self::read_json(&dir.join("state.json")),
        };
        if record.config.name.is_empty() {
            record.config.name = character_id.clone();
        }
        self.cache.insert(character_id, record.clone());
        record
    }

    pub fn invalidate(&self, character_id: &str) {
        self.cache.remove(&normalize_character_id(character_id));
    }

    pub async fn save_config(
        &self,
        character_id: &str,
        config: &CharacterConfig,
    ) -> Result<(), SoulError> {
        let lock = self.write_lock(character_id);
        let _guard = lock.lock().await;
        let path = self.character_dir(character_id).join("config.json");
        Self::write_json_atomic(&path, config)?;
        self.invalidate(character_id);
        Ok(())
    }

    pub async fn save_soul(
        &self,
        character_id: &str,
        soul: &SoulProfile,
    ) -> Result<(), SoulError> {
        let lock = self.write_lock(character_id);
        let _guard = lock.lock().await;
        let path = self.character_dir(character_id).join("soul.json");
        Self::write_json_atomic(&path, soul)?;
        self.invalidate(character_id);
        Ok(())
    }

    pub async fn save_state(
        &self,
        character_id: &str,
        state: &RuntimeState,
    ) -> Result<(), SoulError> {
        let lock = self.write_lock(character_id);
        let _guard = lock.lock().await;
        let path = self.character_dir(character_id).join("state.json");
        Self::write_json_atomic(&path, state)?;
        self.invalidate(character_id);
        Ok(())
    }

    // --- Per-plugin persisted data ---

    /// Strips path components to prevent traversal out of the data dir.
    fn sanitize_name(name: &str) -> String {
        Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string())
    }

    fn data_root(&self, character_id: &str) -> PathBuf {
        self.character_dir(character_id).join("data")
    }

    pub fn load_data(&self, character_id: &str, plugin_id: &str) -> Value {
        let path = self
            .data_root(character_id)
            .join(format!("{}.json", Self::sanitize_name(plugin_id)));
        if !path.is_file() {
            return Value::Object(Default::default());
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub async fn save_data(
        &self,
        character_id: &str,
        plugin_id: &str,
        data: &Value,
    ) -> Result<(), SoulError> {
        let lock = self.write_lock(character_id);
        let _guard = lock.lock().await;
        let path = self
            .data_root(character_id)
            .join(format!("{}.json", Self::sanitize_name(plugin_id)));
        Self::write_json_atomic(&path, data)
    }

    /// Per-plugin binary asset directory, created on first use.
    pub fn data_dir(&self, character_id: &str, plugin_id: &str) -> Result<PathBuf, SoulError> {
        let dir = self
            .data_root(character_id)
            .join(Self::sanitize_name(plugin_id));
        std::fs::create_dir_all(&dir).map_err(|e| SoulError::Io(e.to_string()))?;
        Ok(dir)
    }

    /// Character ids present on disk.
    pub fn list_characters(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CharacterStore::new(dir.path());

        let config = CharacterConfig {
            name: "Alice".to_string(),
            description: "a jazz fan".to_string(),
            system_prompt: "be warm".to_string(),
            extra: HashMap::new(),
        };
        store.save_config("Alice", &config).await.unwrap();

        let record = store.load("alice");
        assert_eq!(record.config.name, "Alice");
        assert_eq!(record.config.description, "a jazz fan");
        // Missing soul/state files come back as defaults.
        assert_eq!(record.soul.current_mood, "neutral");
        assert_eq!(record.state.energy, 1.0);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CharacterStore::new(dir.path());
        store
            .save_config("alice", &CharacterConfig::default())
            .await
            .unwrap();

        let char_dir = store.character_dir("alice");
        assert!(char_dir.join("config.json").is_file());
        assert!(!char_dir.join("config.tmp").exists());
        // Written content is complete, parseable JSON.
        let content = std::fs::read_to_string(char_dir.join("config.json")).unwrap();
        let _: CharacterConfig = serde_json::from_str(&content).unwrap();
    }

    #[tokio::test]
    async fn plugin_data_is_scoped_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = CharacterStore::new(dir.path());

        let payload = serde_json::json!({"count": 3});
        store
            .save_data("alice", "../../evil", &payload)
            .await
            .unwrap();
        // Path traversal is neutralized: file lands inside the data root.
        assert!(store
            .character_dir("alice")
            .join("data")
            .join("evil.json")
            .is_file());
        assert_eq!(store.load_data("alice", "evil"), payload);
    }

    #[tokio::test]
    async fn cache_is_invalidated_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = CharacterStore::new(dir.path());
        let _ = store.load("alice");

        let mut soul = SoulProfile::default();
        soul.current_mood = "cheerful".to_string();
        store.save_soul("alice", &soul).await.unwrap();

        assert_eq!(store.load("alice").soul.current_mood, "cheerful");
    }
}
