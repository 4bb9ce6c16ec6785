//! LLM driver abstraction and the feature-route manager.
//!
//! A [`LlmDriver`] turns a [`ChatRequest`] into a stream of [`ChatDelta`]s
//! (tokens and tool-call fragments). The [`LlmManager`] maps logical features
//! ("chat", "dreaming", …) to a concrete provider, model, and generation
//! parameters, optionally perturbed by the character's mood.

mod manager;
mod mock;
mod openai;

pub use manager::{GenerationParams, LlmManager, FEATURE_CHAT, FEATURE_DREAMING, FEATURE_EVOLUTION, FEATURE_MEMORY_EXTRACT};
pub use mock::{MockDriver, ScriptedTurn};
pub use openai::OpenAiDriver;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_stream::StreamExt;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no route configured for feature '{0}'")]
    RouteMissing(String),
    #[error("no provider registered with id '{0}'")]
    ProviderMissing(String),
    #[error("request build failed: {0}")]
    Request(String),
    #[error("LLM API error: {0}")]
    Api(String),
    #[error("LLM stream error: {0}")]
    Stream(String),
    #[error("LLM call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the conversation sent to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Set on assistant messages that requested tool calls.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Set on tool messages: which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A completed tool call requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

/// Tool definition advertised to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// One fragment of a streamed tool call, accumulated by `index`.
#[derive(Clone, Debug)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

/// One streamed chunk from the model.
#[derive(Clone, Debug)]
pub enum ChatDelta {
    Token(String),
    ToolCall(ToolCallDelta),
    Done,
}

/// Driver request: messages, model, generation parameters, optional tools.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.7,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: Vec::new(),
        }
    }
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatDelta, LlmError>> + Send>>;

/// A chat-completion backend. Implementations stream deltas; non-streaming
/// call sites collect the stream with [`collect_text`].
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Opens a streaming completion. The stream ends with [`ChatDelta::Done`].
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatStream, LlmError>;

    /// Model ids this provider serves.
    async fn list_models(&self) -> Result<Vec<String>, LlmError>;
}

/// Strips markdown code fences some models wrap around JSON output.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Drains a stream into the full assistant text, discarding tool deltas.
pub async fn collect_text(mut stream: ChatStream) -> Result<String, LlmError> {
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        match delta? {
            ChatDelta::Token(t) => text.push_str(&t),
            ChatDelta::ToolCall(_) => {}
            ChatDelta::Done => break,
        }
    }
    Ok(text)
}

/// Accumulates buffered tool-call deltas into completed requests, keyed and
/// ordered by stream index.
pub fn assemble_tool_calls(deltas: &[ToolCallDelta]) -> Vec<ToolCallRequest> {
    let mut by_index: std::collections::BTreeMap<u32, (String, String, String)> =
        std::collections::BTreeMap::new();
    for delta in deltas {
        let entry = by_index.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            if !id.is_empty() {
                entry.0 = id.clone();
            }
        }
        if let Some(name) = &delta.name {
            entry.1.push_str(name);
        }
        entry.2.push_str(&delta.arguments_delta);
    }
    by_index
        .into_values()
        .filter(|(_, name, _)| !name.is_empty())
        .map(|(id, name, arguments)| ToolCallRequest {
            id,
            name,
            arguments,
        })
        .collect()
}
