//! OpenAI-compatible chat driver. Any provider exposing the Chat Completions
//! API works through a custom base url (deepseek, pollinations, local
//! gateways); the stream yields content deltas and tool-call fragments.

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessage, ChatCompletionTool, ChatCompletionToolChoiceOption,
        ChatCompletionTools, CreateChatCompletionRequestArgs, FunctionCall, FunctionObject,
        ToolChoiceOptions,
    },
    Client,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use super::{
    ChatDelta, ChatMessage, ChatRequest, ChatRole, ChatStream, LlmDriver, LlmError, ToolCallDelta,
};

/// Driver for one configured provider endpoint.
pub struct OpenAiDriver {
    client: Client<OpenAIConfig>,
    provider_id: String,
    models: Vec<String>,
}

impl OpenAiDriver {
    /// Builds a driver from provider settings. `base_url = None` uses the
    /// OpenAI default endpoint.
    pub fn new(provider_id: impl Into<String>, provider: &config::ProviderConfig) -> Self {
        let mut openai_config = OpenAIConfig::new();
        if let Some(base) = &provider.base_url {
            openai_config = openai_config.with_api_base(base.clone());
        }
        if let Some(key) = &provider.api_key {
            openai_config = openai_config.with_api_key(key.clone());
        }
        Self {
            client: Client::with_config(openai_config),
            provider_id: provider_id.into(),
            models: provider.models.clone(),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn convert_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            let converted = match message.role {
                ChatRole::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(message.content.as_str()),
                ),
                ChatRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(message.content.as_str()),
                ),
                ChatRole::Assistant => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    builder.content(message.content.as_str());
                    if !message.tool_calls.is_empty() {
                        let tool_calls: Vec<ChatCompletionMessageToolCalls> = message
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                ChatCompletionMessageToolCalls::Function(
                                    ChatCompletionMessageToolCall {
                                        id: tc.id.clone(),
                                        function: FunctionCall {
                                            name: tc.name.clone(),
                                            arguments: tc.arguments.clone(),
                                        },
                                    },
                                )
                            })
                            .collect();
                        builder.tool_calls(tool_calls);
                    }
                    ChatCompletionRequestMessage::Assistant(
                        builder
                            .build()
                            .map_err(|e| LlmError::Request(e.to_string()))?,
                    )
                }
                ChatRole::Tool => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(message.content.as_str())
                        .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
                        .build()
                        .map_err(|e| LlmError::Request(e.to_string()))?,
                ),
            };
            out.push(converted);
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.model.clone());
        args.messages(Self::convert_messages(&request.messages)?);
        args.temperature(request.temperature);
        if let Some(top_p) = request.top_p {
            args.top_p(top_p);
        }
        if let Some(p) = request.presence_penalty {
            args.presence_penalty(p);
        }
        if let Some(p) = request.frequency_penalty {
            args.frequency_penalty(p);
        }
        args.stream(true);

        if !request.tools.is_empty() {
            let tools: Vec<ChatCompletionTools> = request
                .tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect();
            args.tools(tools);
            args.tool_choice(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::Auto));
        }

        let api_request = args.build().map_err(|e| LlmError::Request(e.to_string()))?;
        debug!(
            provider = %self.provider_id,
            model = %request.model,
            message_count = request.messages.len(),
            tools_count = request.tools.len(),
            "chat completion stream open"
        );

        let stream = self
            .client
            .chat()
            .create_stream(api_request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let mapped = stream
            .map(|result| match result {
                Ok(chunk) => {
                    let mut deltas: Vec<Result<ChatDelta, LlmError>> = Vec::new();
                    for choice in chunk.choices {
                        let delta = &choice.delta;
                        if let Some(content) = &delta.content {
                            if !content.is_empty() {
                                deltas.push(Ok(ChatDelta::Token(content.clone())));
                            }
                        }
                        if let Some(tool_calls) = &delta.tool_calls {
                            for tc in tool_calls {
                                let (name, arguments_delta) = match &tc.function {
                                    Some(f) => (
                                        f.name.clone(),
                                        f.arguments.clone().unwrap_or_default(),
                                    ),
                                    None => (None, String::new()),
                                };
                                deltas.push(Ok(ChatDelta::ToolCall(ToolCallDelta {
                                    index: tc.index,
                                    id: tc.id.clone(),
                                    name,
                                    arguments_delta,
                                })));
                            }
                        }
                    }
                    deltas
                }
                Err(e) => vec![Err(LlmError::Stream(e.to_string()))],
            })
            .flat_map(futures::stream::iter)
            .chain(futures::stream::iter(vec![Ok(ChatDelta::Done)]));

        Ok(Box::pin(mapped))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.models.clone())
    }
}
