//! Tool providers: sources of tool definitions and execution for the chat
//! pipeline's tool-call loop.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::llm::ToolSpec;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// A source of tools. The pipeline collects `tools()` from every registered
/// provider during tool prep and dispatches calls back by name.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Stable provider name, used in logs.
    fn name(&self) -> &str;

    /// Tool definitions this provider serves.
    async fn tools(&self) -> Vec<ToolSpec>;

    /// Executes one tool call. `arguments` is the parsed JSON object the
    /// model produced.
    async fn call(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolError>;
}

/// Built-in web search over the DuckDuckGo instant-answer API. No key
/// required; answers come from abstracts and related topics.
pub struct WebSearchProvider {
    client: reqwest::Client,
}

impl Default for WebSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSearchProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn search(&self, query: &str) -> Result<String, ToolError> {
        let response = self
            .client
            .get("https://api.duckduckgo.com/")
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let abstract_text = body
            .get("AbstractText")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !abstract_text.is_empty() {
            return Ok(abstract_text.to_string());
        }

        let topics: Vec<String> = body
            .get("RelatedTopics")
            .and_then(Value::as_array)
            .map(|topics| {
                topics
                    .iter()
                    .filter_map(|t| t.get("Text").and_then(Value::as_str))
                    .take(3)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if topics.is_empty() {
            Ok(format!("No results found for '{query}'."))
        } else {
            Ok(topics.join("\n"))
        }
    }
}

#[async_trait]
impl ToolProvider for WebSearchProvider {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "web_search".to_string(),
            description: "Search the web for current information. \
                          Use for facts you do not know or recent events."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        }]
    }

    async fn call(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolError> {
        if tool_name != "web_search" {
            return Err(ToolError::UnknownTool(tool_name.to_string()));
        }
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("missing 'query'".to_string()))?;
        debug!(query, "web search");
        self.search(query).await
    }
}
