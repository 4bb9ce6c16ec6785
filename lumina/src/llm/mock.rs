//! Scripted mock driver for tests and offline development.
//!
//! Each call to `chat_completion` consumes the next [`ScriptedTurn`] and
//! streams its content word by word, then its tool calls, then `Done`. When
//! the script is exhausted the last turn repeats.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ChatDelta, ChatRequest, ChatStream, LlmDriver, LlmError, ToolCallDelta, ToolCallRequest,
};

/// One scripted model response.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call_0".to_string(),
                name: name.into(),
                arguments: arguments.into(),
            }],
        }
    }
}

/// Mock [`LlmDriver`] returning scripted turns in order. Records every
/// request's messages for transcript assertions.
pub struct MockDriver {
    script: Mutex<Vec<ScriptedTurn>>,
    cursor: Mutex<usize>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockDriver {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script: Mutex::new(script),
            cursor: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single(content: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::text(content)])
    }

    /// Requests seen so far (cloned).
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_turn(&self) -> ScriptedTurn {
        let (Ok(script), Ok(mut cursor)) = (self.script.lock(), self.cursor.lock()) else {
            return ScriptedTurn::default();
        };
        let turn = script
            .get(*cursor)
            .or_else(|| script.last())
            .cloned()
            .unwrap_or_default();
        if *cursor + 1 < script.len() {
            *cursor += 1;
        }
        turn
    }
}

#[async_trait]
impl LlmDriver for MockDriver {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let turn = self.next_turn();

        let mut deltas: Vec<Result<ChatDelta, LlmError>> = Vec::new();
        let words: Vec<&str> = turn.content.split_inclusive(' ').collect();
        for word in words {
            deltas.push(Ok(ChatDelta::Token(word.to_string())));
        }
        for (index, call) in turn.tool_calls.iter().enumerate() {
            deltas.push(Ok(ChatDelta::ToolCall(ToolCallDelta {
                index: index as u32,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_delta: call.arguments.clone(),
            })));
        }
        deltas.push(Ok(ChatDelta::Done));
        Ok(Box::pin(futures::stream::iter(deltas)))
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        Ok(vec!["mock".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{collect_text, ChatMessage};

    #[tokio::test]
    async fn streams_scripted_turns_in_order() {
        let driver = MockDriver::new(vec![
            ScriptedTurn::text("first reply"),
            ScriptedTurn::text("second reply"),
        ]);

        let request = ChatRequest::new(vec![ChatMessage::user("hi")], "mock");
        let text = collect_text(driver.chat_completion(request.clone()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(text, "first reply");

        let text = collect_text(driver.chat_completion(request).await.unwrap())
            .await
            .unwrap();
        assert_eq!(text, "second reply");
        assert_eq!(driver.requests().len(), 2);
    }
}
