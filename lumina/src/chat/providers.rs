//! Context providers: each contributes a block to the chat prompt. The RAG
//! provider retrieves memories for the current question; the soul provider
//! renders the character's system prompt.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::llm::{ChatMessage, ChatRole};
use crate::memory::{Embedder, MemoryStore, SearchParams};
use crate::soul::SoulService;

/// Where a provider's block lands in the final prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Appended to the system message.
    System,
    /// Spliced into the last user message, positionally anchored to the
    /// question.
    UserSplice,
}

#[derive(Clone, Debug)]
pub struct ContextBlock {
    pub content: String,
    pub placement: Placement,
}

/// Per-request view handed to providers.
pub struct ChatContext<'a> {
    pub messages: &'a [ChatMessage],
    pub user_id: &'a str,
    pub character_id: &'a str,
    pub enable_rag: bool,
}

impl ChatContext<'_> {
    /// The last user message's text, the query most providers care about.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

/// A context source queried during the pipeline's context stage. Providers
/// may return `None` (nothing to contribute); failures are logged inside the
/// provider and surface as `None`.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn provide(&self, ctx: &ChatContext<'_>) -> Option<ContextBlock>;
}

/// Retrieves long-term memories relevant to the last user message via hybrid
/// search and formats them as a "Relevant Memories" block.
pub struct RagContextProvider {
    memory: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    params: SearchParams,
}

impl RagContextProvider {
    pub fn new(
        memory: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        memory_config: &config::MemoryConfig,
    ) -> Self {
        Self {
            memory,
            embedder,
            params: SearchParams {
                limit: 5,
                vector_weight: memory_config.vector_weight,
                initial_threshold: memory_config.initial_threshold,
                min_results: memory_config.min_results,
                ..SearchParams::default()
            },
        }
    }
}

#[async_trait]
impl ContextProvider for RagContextProvider {
    fn name(&self) -> &str {
        "rag"
    }

    async fn provide(&self, ctx: &ChatContext<'_>) -> Option<ContextBlock> {
        if !ctx.enable_rag {
            return None;
        }
        let query = ctx.last_user_text()?.trim();
        if query.len() < 3 {
            return None;
        }

        let vector = match self.embedder.embed(&[query]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "rag provider: embedding failed");
                return None;
            }
        };

        let hits = match self
            .memory
            .search_hybrid(query, &vector, ctx.character_id, self.params.clone())
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "rag provider: hybrid search failed");
                return None;
            }
        };
        if hits.is_empty() {
            return None;
        }

        let lines: Vec<String> = hits
            .iter()
            .map(|hit| format!("- {} ({})", hit.content, hit.created_at))
            .collect();
        Some(ContextBlock {
            content: format!("## Relevant Memories\n{}", lines.join("\n")),
            placement: Placement::UserSplice,
        })
    }
}

/// Renders the character's system prompt (static identity + dynamic state).
pub struct SoulContextProvider {
    soul: Arc<SoulService>,
}

impl SoulContextProvider {
    pub fn new(soul: Arc<SoulService>) -> Self {
        Self { soul }
    }
}

#[async_trait]
impl ContextProvider for SoulContextProvider {
    fn name(&self) -> &str {
        "soul"
    }

    async fn provide(&self, _ctx: &ChatContext<'_>) -> Option<ContextBlock> {
        let prompt = self.soul.system_prompt();
        if prompt.trim().is_empty() {
            return None;
        }
        Some(ContextBlock {
            content: prompt,
            placement: Placement::System,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_text_skips_assistant_messages() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply 2"),
        ];
        let ctx = ChatContext {
            messages: &messages,
            user_id: "u1",
            character_id: "alice",
            enable_rag: true,
        };
        assert_eq!(ctx.last_user_text(), Some("second"));
    }
}
