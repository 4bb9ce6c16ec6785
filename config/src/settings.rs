//! Typed settings snapshot. Every field has a serde default so a partial
//! `lumina.toml` (or none at all) still yields a complete config.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Frozen, read-only settings for the whole runtime. Cloned into each
/// subsystem at bootstrap; nothing mutates it afterwards.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LuminaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub soul: SoulConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8600
}

/// On-disk layout. Everything lives under `data_dir`; the derived paths are
/// methods so a relocated data dir moves the whole tree.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl DataConfig {
    pub fn characters_dir(&self) -> PathBuf {
        self.data_dir.join("characters")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir.join("plugins")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lumina.db")
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// RRF weight of the vector list; the text list gets `1 - vector_weight`.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    /// Starting cosine-similarity threshold for vector search.
    #[serde(default = "default_initial_threshold")]
    pub initial_threshold: f32,
    /// Below this many fused results the threshold is relaxed and retried.
    #[serde(default = "default_min_results")]
    pub min_results: usize,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            initial_threshold: default_initial_threshold(),
            min_results: default_min_results(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

fn default_vector_weight() -> f32 {
    0.4
}

fn default_initial_threshold() -> f32 {
    0.6
}

fn default_min_results() -> usize {
    3
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds without `input_text` before a character counts as idle.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Unprocessed log entries read per cycle; a partial batch accumulates.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Terminal batches older than this are purged.
    #[serde(default = "default_batch_retention_secs")]
    pub batch_retention_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            idle_secs: default_idle_secs(),
            batch_size: default_batch_size(),
            batch_retention_secs: default_batch_retention_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_idle_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    20
}

fn default_batch_retention_secs() -> u64 {
    3600
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Short-term history bound; oldest turns are evicted FIFO.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

fn default_max_turns() -> usize {
    40
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

/// One LLM provider endpoint. `base_url = None` means the provider's own
/// default (api.openai.com for the openai id).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Generation parameters for one logical feature ("chat", "dreaming", …).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoulConfig {
    #[serde(default = "default_character")]
    pub default_character: String,
    /// Local hour for the scheduled trait-evolution pass.
    #[serde(default = "default_evolution_hour")]
    pub evolution_hour: u32,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            default_character: default_character(),
            evolution_hour: default_evolution_hour(),
        }
    }
}

fn default_character() -> String {
    "hiyori".to_string()
}

fn default_evolution_hour() -> u32 {
    4
}
