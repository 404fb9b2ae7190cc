//! Responses as seen by the host tool, plus conversations and tool chains.

use crate::llm::prompt::{Prompt, ToolCall};
use crate::llm::types::{ContentBlock, ProviderMessage, Usage};
use serde::Serialize;
use serde_json::{json, Value};

/// Name of the forced tool used to obtain schema-conforming output
pub const STRUCTURED_OUTPUT_TOOL: &str = "output_structured_data";

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResponseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cache counters, only present when one of them is non-zero
    pub token_details: Option<Value>,
}

impl From<&Usage> for ResponseUsage {
    fn from(usage: &Usage) -> Self {
        let mut details = serde_json::Map::new();
        if usage.cache_creation_input_tokens > 0 {
            details.insert(
                "cache_creation_input_tokens".to_string(),
                json!(usage.cache_creation_input_tokens),
            );
        }
        if usage.cache_read_input_tokens > 0 {
            details.insert(
                "cache_read_input_tokens".to_string(),
                json!(usage.cache_read_input_tokens),
            );
        }
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            token_details: if details.is_empty() {
                None
            } else {
                Some(Value::Object(details))
            },
        }
    }
}

/// Serialize the final provider message the way the host stores it:
/// usage is dropped (reported separately) and text blocks always carry `citations`.
pub fn response_json(message: &ProviderMessage) -> Value {
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text, citations } => json!({
                "citations": citations.clone().unwrap_or(Value::Null),
                "text": text,
                "type": "text",
            }),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        })
        .collect();

    json!({
        "id": message.id,
        "content": content,
        "model": message.model,
        "role": message.role,
        "stop_reason": message.stop_reason,
        "stop_sequence": message.stop_sequence,
        "type": message.message_type,
    })
}

/// A completed model response
#[derive(Debug, Clone)]
pub struct Response {
    pub prompt: Prompt,
    pub model_id: String,
    chunks: Vec<String>,
    /// Provider content blocks, kept to replay the turn in later requests
    pub content: Vec<ContentBlock>,
    pub response_json: Value,
    pub usage: ResponseUsage,
    tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
}

impl Response {
    pub fn new(prompt: Prompt, model_id: impl Into<String>, message: &ProviderMessage) -> Self {
        let tool_calls = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } if name != STRUCTURED_OUTPUT_TOOL => {
                    Some(ToolCall {
                        name: name.clone(),
                        arguments: input.clone(),
                        tool_call_id: Some(id.clone()),
                    })
                }
                _ => None,
            })
            .collect();

        Self {
            prompt,
            model_id: model_id.into(),
            chunks: Vec::new(),
            content: message.content.clone(),
            response_json: response_json(message),
            usage: ResponseUsage::from(&message.usage),
            tool_calls,
            stop_reason: message.stop_reason.clone(),
        }
    }

    pub fn with_chunks(mut self, chunks: Vec<String>) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn text(&self) -> String {
        self.chunks.concat()
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn input_tokens(&self) -> u32 {
        self.usage.input_tokens
    }

    pub fn output_tokens(&self) -> u32 {
        self.usage.output_tokens
    }
}

/// Ordered history of completed responses
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub responses: Vec<Response>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, response: Response) {
        self.responses.push(response);
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Result of running a prompt through a tool-calling chain
#[derive(Debug, Clone, Default)]
pub struct ChainResponse {
    pub responses: Vec<Response>,
}

impl ChainResponse {
    pub fn text(&self) -> String {
        self.responses.iter().map(Response::text).collect()
    }

    pub fn last(&self) -> Option<&Response> {
        self.responses.last()
    }
}
