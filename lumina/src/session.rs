//! Short-term conversation history, persisted per (user, character) pair.
//!
//! History is a FIFO-bounded list of turns; the bound (default 40) keeps the
//! chat prompt from growing without limit. Files live under the sessions dir
//! and are written atomically.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::normalize_character_id;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One conversation turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// Persisted session state for one (user, character) pair.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub session_id: u64,
    #[serde(default)]
    pub short_term_history: Vec<Turn>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Loads, bounds, and persists session state. Reads go through an in-memory
/// cache; writes are atomic (tmp-then-rename).
pub struct SessionManager {
    dir: PathBuf,
    max_turns: usize,
    cache: DashMap<String, SessionState>,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>, max_turns: usize) -> Self {
        Self {
            dir: dir.into(),
            max_turns,
            cache: DashMap::new(),
        }
    }

    /// Replaces characters outside `[a-zA-Z0-9_-]` so ids cannot traverse out
    /// of the sessions dir.
    fn sanitize(id: &str) -> String {
        let cleaned: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "default".to_string()
        } else {
            cleaned
        }
    }

    fn key(user_id: &str, character_id: &str) -> String {
        format!(
            "{}_{}",
            Self::sanitize(&normalize_character_id(character_id)),
            Self::sanitize(user_id)
        )
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn read_state(path: &Path) -> SessionState {
        if !path.is_file() {
            return SessionState::default();
        }
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| {
                warn!(path = %path.display(), "unreadable session file; starting fresh");
                SessionState::default()
            })
    }

    pub fn load(&self, user_id: &str, character_id: &str) -> SessionState {
        let key = Self::key(user_id, character_id);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let state = Self::read_state(&self.path_for(&key));
        self.cache.insert(key, state.clone());
        state
    }

    pub fn save(
        &self,
        user_id: &str,
        character_id: &str,
        state: SessionState,
    ) -> Result<(), SessionError> {
        let key = Self::key(user_id, character_id);
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        std::fs::rename(&tmp, &path)?;
        self.cache.insert(key, state);
        Ok(())
    }

    /// Appends a user/assistant turn pair, evicting the oldest turns beyond
    /// the bound.
    pub fn add_turn(
        &self,
        user_id: &str,
        character_id: &str,
        user_message: &str,
        assistant_message: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.load(user_id, character_id);
        state.short_term_history.push(Turn {
            role: "user".to_string(),
            content: user_message.to_string(),
        });
        state.short_term_history.push(Turn {
            role: "assistant".to_string(),
            content: assistant_message.to_string(),
        });
        if state.short_term_history.len() > self.max_turns {
            let excess = state.short_term_history.len() - self.max_turns;
            state.short_term_history.drain(..excess);
        }
        self.save(user_id, character_id, state)
    }

    pub fn history(&self, user_id: &str, character_id: &str) -> Vec<Turn> {
        self.load(user_id, character_id).short_term_history
    }

    /// Clears history but keeps metadata and session id.
    pub fn clear_history(&self, user_id: &str, character_id: &str) -> Result<(), SessionError> {
        let mut state = self.load(user_id, character_id);
        state.short_term_history.clear();
        self.save(user_id, character_id, state)
    }

    /// Removes the session entirely.
    pub fn clear_session(&self, user_id: &str, character_id: &str) -> Result<(), SessionError> {
        let key = Self::key(user_id, character_id);
        self.cache.remove(&key);
        let path = self.path_for(&key);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_turn_roundtrip_and_bound() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path(), 4);

        for i in 0..4 {
            sessions
                .add_turn("u1", "Alice", &format!("q{i}"), &format!("a{i}"))
                .unwrap();
        }
        let history = sessions.history("u1", "alice");
        // 8 turns written, bounded to 4, oldest evicted first.
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[3].content, "a3");
    }

    #[test]
    fn sessions_are_scoped_per_pair() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path(), 40);
        sessions.add_turn("u1", "alice", "hi", "hello").unwrap();
        assert!(sessions.history("u2", "alice").is_empty());
        assert!(sessions.history("u1", "bob").is_empty());
    }

    #[test]
    fn ids_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path(), 40);
        sessions
            .add_turn("../evil", "Alice", "hi", "hello")
            .unwrap();
        // File name is flattened, not a traversal.
        let files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        assert_eq!(files, vec!["alice____evil.json".to_string()]);
    }

    #[test]
    fn clear_history_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path(), 40);
        let mut state = sessions.load("u1", "alice");
        state
            .metadata
            .insert("locale".to_string(), serde_json::json!("en"));
        sessions.save("u1", "alice", state).unwrap();
        sessions.add_turn("u1", "alice", "hi", "hello").unwrap();

        sessions.clear_history("u1", "alice").unwrap();
        let state = sessions.load("u1", "alice");
        assert!(state.short_term_history.is_empty());
        assert_eq!(state.metadata["locale"], "en");
    }
}
