//! The chat pipeline: transforms a raw user message into a streaming LLM
//! response augmented with memory and tools.
//!
//! Three stages per request:
//! 1. **Tool prep** — resolve the chat driver and model, collect tool
//!    definitions from every registered [`ToolProvider`].
//! 2. **Context build** — query every [`ContextProvider`] in registration
//!    order; system blocks are concatenated onto the system message, RAG
//!    content is spliced into the last user message.
//! 3. **Execution** — stream the first pass; if the model emits tool calls,
//!    run them sequentially and stream a second pass with tools disabled to
//!    force a natural-language answer.

mod bridge;
mod providers;
mod tools;

pub use bridge::ChatBridge;
pub use providers::{
    ChatContext, ContextBlock, ContextProvider, Placement, RagContextProvider, SoulContextProvider,
};
pub use tools::{ToolError, ToolProvider, WebSearchProvider};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{
    assemble_tool_calls, ChatDelta, ChatMessage, ChatRequest, ChatRole, LlmError, LlmManager,
    ToolCallDelta, ToolSpec, FEATURE_CHAT,
};
use crate::soul::SoulService;

const LLM_PASS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("chat request cancelled")]
    Cancelled,
}

/// One chat request: prior history plus the current user message, without a
/// system message (the pipeline builds that).
#[derive(Clone, Debug)]
pub struct ChatRequestSpec {
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    pub character_id: String,
    pub enable_rag: bool,
    pub enable_tools: bool,
    /// Overrides the routed model for this request only.
    pub model: Option<String>,
}

impl ChatRequestSpec {
    pub fn new(messages: Vec<ChatMessage>, user_id: &str, character_id: &str) -> Self {
        Self {
            messages,
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            enable_rag: true,
            enable_tools: true,
            model: None,
        }
    }
}

/// The staged request processor. Providers register once at bootstrap (or
/// when a plugin loads); requests then flow through without further wiring.
pub struct ChatPipeline {
    llm: Arc<LlmManager>,
    soul: Option<Arc<SoulService>>,
    context_providers: RwLock<Vec<Arc<dyn ContextProvider>>>,
    tool_providers: RwLock<Vec<Arc<dyn ToolProvider>>>,
}

impl ChatPipeline {
    pub fn new(llm: Arc<LlmManager>, soul: Option<Arc<SoulService>>) -> Self {
        Self {
            llm,
            soul,
            context_providers: RwLock::new(Vec::new()),
            tool_providers: RwLock::new(Vec::new()),
        }
    }

    pub fn register_context_provider(&self, provider: Arc<dyn ContextProvider>) {
        if let Ok(mut providers) = self.context_providers.write() {
            debug!(provider = provider.name(), "context provider registered");
            providers.push(provider);
        }
    }

    pub fn register_tool_provider(&self, provider: Arc<dyn ToolProvider>) {
        if let Ok(mut providers) = self.tool_providers.write() {
            debug!(provider = provider.name(), "tool provider registered");
            providers.push(provider);
        }
    }

    fn context_providers(&self) -> Vec<Arc<dyn ContextProvider>> {
        self.context_providers
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn tool_providers(&self) -> Vec<Arc<dyn ToolProvider>> {
        self.tool_providers
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Stage 1: tool definitions and a name → provider dispatch map.
    async fn prepare_tools(
        &self,
        enable_tools: bool,
    ) -> (Vec<ToolSpec>, HashMap<String, Arc<dyn ToolProvider>>) {
        let mut specs = Vec::new();
        let mut dispatch = HashMap::new();
        if !enable_tools {
            return (specs, dispatch);
        }
        for provider in self.tool_providers() {
            for spec in provider.tools().await {
                dispatch.insert(spec.name.clone(), Arc::clone(&provider));
                specs.push(spec);
            }
        }
        (specs, dispatch)
    }

    /// Stage 2: assemble the final message array. Provider outputs join the
    /// system message in registration order; RAG blocks are spliced into the
    /// last user message so they stay anchored to the question.
    async fn build_context(&self, spec: &ChatRequestSpec) -> Vec<ChatMessage> {
        let ctx = ChatContext {
            messages: &spec.messages,
            user_id: &spec.user_id,
            character_id: &spec.character_id,
            enable_rag: spec.enable_rag,
        };

        let mut system_parts: Vec<String> = Vec::new();
        let mut splice_parts: Vec<String> = Vec::new();
        for provider in self.context_providers() {
            let Some(block) = provider.provide(&ctx).await else {
                continue;
            };
            if block.content.trim().is_empty() {
                continue;
            }
            match block.placement {
                Placement::System => system_parts.push(block.content),
                Placement::UserSplice => splice_parts.push(block.content),
            }
        }

        let mut messages = Vec::with_capacity(spec.messages.len() + 1);
        if !system_parts.is_empty() {
            messages.push(ChatMessage::system(system_parts.join("\n\n")));
        }
        messages.extend(spec.messages.iter().cloned());

        if !splice_parts.is_empty() {
            if let Some(last_user) = messages
                .iter_mut()
                .rev()
                .find(|m| m.role == ChatRole::User)
            {
                last_user.content = format!(
                    "{}\n\n{}",
                    splice_parts.join("\n\n"),
                    last_user.content
                );
            }
        }
        messages
    }

    /// Streams one LLM pass, forwarding tokens and buffering tool deltas.
    async fn stream_pass(
        &self,
        request: ChatRequest,
        token_tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<ToolCallDelta>), PipelineError> {
        let driver = self.llm.driver(FEATURE_CHAT)?;
        let pass = async {
            let mut stream = driver.chat_completion(request).await?;
            let mut text = String::new();
            let mut deltas: Vec<ToolCallDelta> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    next = stream.next() => match next {
                        None => break,
                        Some(Ok(ChatDelta::Token(token))) => {
                            text.push_str(&token);
                            let _ = token_tx.send(token).await;
                        }
                        Some(Ok(ChatDelta::ToolCall(delta))) => deltas.push(delta),
                        Some(Ok(ChatDelta::Done)) => break,
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
            Ok((text, deltas))
        };
        match tokio::time::timeout(LLM_PASS_TIMEOUT, pass).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(LLM_PASS_TIMEOUT).into()),
        }
    }

    /// Runs the full pipeline, streaming tokens through `token_tx`. Returns
    /// the complete response text.
    pub async fn run(
        &self,
        spec: ChatRequestSpec,
        token_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<String, PipelineError> {
        // Stage 1: tool prep.
        let (tool_specs, dispatch) = self.prepare_tools(spec.enable_tools).await;

        // Stage 2: context build.
        let messages = self.build_context(&spec).await;
        let arousal = self.soul.as_ref().map(|s| s.arousal());

        let model = match &spec.model {
            Some(model) => model.clone(),
            None => self.llm.model_name(FEATURE_CHAT)?,
        };
        let params = self.llm.parameters(FEATURE_CHAT, arousal)?;

        info!(
            character_id = %spec.character_id,
            model = %model,
            input = %serde_json::to_string(&messages).unwrap_or_default(),
            "chat pipeline request"
        );

        // Stage 3: execution, first pass with tools.
        let mut request = ChatRequest::new(messages.clone(), model.clone());
        request.temperature = params.temperature;
        request.top_p = params.top_p;
        request.presence_penalty = params.presence_penalty;
        request.frequency_penalty = params.frequency_penalty;
        request.tools = tool_specs;

        let (first_text, deltas) = self.stream_pass(request, &token_tx, &cancel).await?;
        let tool_calls = assemble_tool_calls(&deltas);

        if tool_calls.is_empty() {
            info!(output = %first_text, "chat pipeline response");
            return Ok(first_text);
        }

        // Tool loop: run each call sequentially, then a second pass with
        // tools disabled forces a natural-language answer.
        let mut followup = messages;
        followup.push(ChatMessage::assistant_with_tool_calls(
            first_text.clone(),
            tool_calls.clone(),
        ));

        for call in &tool_calls {
            let arguments: serde_json::Value =
                serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
            let arg_keys: Vec<&str> = arguments
                .as_object()
                .map(|o| o.keys().map(String::as_str).collect())
                .unwrap_or_default();
            info!(tool = %call.name, keys = ?arg_keys, "executing tool call");
            debug!(tool = %call.name, arguments = %call.arguments, "tool call arguments");

            let result = match dispatch.get(&call.name) {
                Some(provider) => match provider.call(&call.name, &arguments).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool execution failed");
                        format!("Error: {e}")
                    }
                },
                None => {
                    warn!(tool = %call.name, "no provider serves this tool");
                    format!("Error: unknown tool '{}'", call.name)
                }
            };
            followup.push(ChatMessage::tool_result(call.id.clone(), result));
        }

        let mut second = ChatRequest::new(followup, model);
        second.temperature = params.temperature;
        second.top_p = params.top_p;
        second.presence_penalty = params.presence_penalty;
        second.frequency_penalty = params.frequency_penalty;

        let (final_text, _) = self.stream_pass(second, &token_tx, &cancel).await?;
        info!(output = %final_text, "chat pipeline response");
        Ok(final_text)
    }
}
