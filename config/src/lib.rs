//! Load configuration for the Lumina runtime: a `lumina.toml` discovered on a
//! fixed search path (working dir → user config dir), merged with project
//! `.env`, with priority **existing env > .env > file**.
//!
//! The result is a [`LuminaConfig`] snapshot: read-only after load, cloned
//! into every subsystem. Runtime code never re-reads the file.

mod dotenv;
mod settings;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use settings::{
    ConsolidationConfig, DataConfig, LlmConfig, LuminaConfig, MemoryConfig, ProviderConfig,
    RouteConfig, ServerConfig, SessionConfig, SoulConfig,
};

/// Config file name searched for in the working dir and the user config dir.
pub const CONFIG_FILE_NAME: &str = "lumina.toml";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Resolves the config file path: `override_path` if given, else `lumina.toml`
/// in the working dir, else `<user config dir>/lumina/lumina.toml`.
/// Returns `None` when no file exists on the search path.
pub fn discover_config_path(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        return Some(p.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        let local = cwd.join(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
    }
    let user = dirs::config_dir()?.join("lumina").join(CONFIG_FILE_NAME);
    if user.is_file() {
        Some(user)
    } else {
        None
    }
}

/// Loads the frozen settings snapshot. A missing file yields built-in
/// defaults; a present but malformed file is an error (fatal at startup).
pub fn load(override_path: Option<&Path>) -> Result<LuminaConfig, LoadError> {
    let path = match discover_config_path(override_path) {
        Some(p) => p,
        None => return Ok(LuminaConfig::default()),
    };
    let content = std::fs::read_to_string(&path).map_err(|source| LoadError::Read {
        path: path.clone(),
        source,
    })?;
    let config: LuminaConfig =
        toml::from_str(&content).map_err(|source| LoadError::Parse { path, source })?;
    Ok(config)
}

/// Loads project `.env` (from `override_dir` or the working dir) and sets
/// environment variables only for keys that are **not** already set, so the
/// existing environment always wins.
pub fn apply_dotenv(override_dir: Option<&Path>) -> Result<(), LoadError> {
    let map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;
    for (key, value) in map {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(Some(&dir.path().join("absent.toml")));
        // An explicit path that does not exist is still "discovered", so the
        // read fails; only search-path misses fall back to defaults.
        assert!(config.is_err());

        let config = LuminaConfig::default();
        assert_eq!(config.session.max_turns, 40);
        assert_eq!(config.consolidation.idle_secs, 300);
    }

    #[test]
    fn load_parses_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumina.toml");
        std::fs::write(
            &path,
            r#"
[server]
host = "0.0.0.0"
port = 9001

[memory]
vector_weight = 0.5
min_results = 2

[llm.providers.deepseek]
base_url = "https://api.deepseek.com/v1"
api_key = "sk-test"
models = ["deepseek-chat"]

[llm.routes.chat]
provider = "deepseek"
model = "deepseek-chat"
temperature = 0.8
"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.memory.vector_weight, 0.5);
        assert_eq!(config.memory.min_results, 2);
        // Untouched sections keep defaults.
        assert_eq!(config.memory.initial_threshold, 0.6);
        let route = config.llm.routes.get("chat").unwrap();
        assert_eq!(route.provider, "deepseek");
        assert_eq!(route.temperature, 0.8);
        let provider = config.llm.providers.get("deepseek").unwrap();
        assert_eq!(provider.models, vec!["deepseek-chat".to_string()]);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumina.toml");
        std::fs::write(&path, "not valid toml [[[\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(LoadError::Parse { .. })));
    }

    #[test]
    fn dotenv_does_not_overwrite_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "LUMINA_TEST_EXISTING=from_dotenv\nLUMINA_TEST_FRESH=fresh\n",
        )
        .unwrap();

        std::env::set_var("LUMINA_TEST_EXISTING", "from_env");
        std::env::remove_var("LUMINA_TEST_FRESH");

        apply_dotenv(Some(dir.path())).unwrap();

        assert_eq!(std::env::var("LUMINA_TEST_EXISTING").unwrap(), "from_env");
        assert_eq!(std::env::var("LUMINA_TEST_FRESH").unwrap(), "fresh");

        std::env::remove_var("LUMINA_TEST_EXISTING");
        std::env::remove_var("LUMINA_TEST_FRESH");
    }
}
