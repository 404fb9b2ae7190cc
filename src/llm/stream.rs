//! Assembly of the final provider message from Anthropic server-sent events.
//!
//! The same accumulator serves live HTTP streams and recorded playback, so both
//! paths apply identical index checks and usage bookkeeping.

use crate::llm::recording::APIRecorder;
use crate::llm::types::{ApiError, ApiErrorContext, ContentBlock, ProviderMessage, Usage};
use crate::llm::StreamingChunk;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct StreamEventCommon {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct StreamErrorDetails {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: ProviderMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        #[serde(flatten)]
        common: StreamEventCommon,
        content_block: StreamContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[serde(flatten)]
        common: StreamEventCommon,
        delta: ContentDelta,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        #[serde(flatten)]
        common: StreamEventCommon,
    },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: StreamErrorDetails },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    data: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "signature_delta")]
    Signature { signature: String },
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(rename = "citations_delta")]
    Citations { citation: Value },
}

/// Accumulates stream events into a [`ProviderMessage`]
#[derive(Default)]
pub struct StreamAccumulator {
    message: ProviderMessage,
    blocks: Vec<ContentBlock>,
    /// Text, thinking or partial JSON of the open block
    current_content: String,
    block_open: bool,
    line_buffer: Vec<u8>,
    recorder: Option<APIRecorder>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every received event `data` payload
    pub fn with_recorder(mut self, recorder: Option<APIRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Feed raw bytes from the wire. Lines may be split across chunks.
    pub fn process_bytes(&mut self, chunk: &[u8]) -> Result<Vec<StreamingChunk>> {
        let mut emitted = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line_buffer);
                let line = String::from_utf8(line)?;
                if let Some(chunk) = self.process_line(line.trim_end_matches('\r'))? {
                    emitted.push(chunk);
                }
            } else {
                self.line_buffer.push(byte);
            }
        }
        Ok(emitted)
    }

    /// Handle one SSE line. Only `data:` lines carry events.
    pub fn process_line(&mut self, line: &str) -> Result<Option<StreamingChunk>> {
        let Some(data) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        else {
            return Ok(None);
        };
        debug!("Received stream event: {}", data);
        if let Some(recorder) = &self.recorder {
            recorder.record_chunk(data)?;
        }
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| anyhow!("Failed to parse stream event: {e}\n{line}"))?;
        self.process_event(event)
    }

    fn process_event(&mut self, event: StreamEvent) -> Result<Option<StreamingChunk>> {
        match event {
            StreamEvent::Error { error } => {
                let error_msg = format!("{}: {}", error.error_type, error.message);
                match error.error_type.as_str() {
                    "overloaded_error" => {
                        Err(ApiErrorContext::from(ApiError::Overloaded(error_msg)).into())
                    }
                    _ => Err(anyhow!("Stream error: {error_msg}")),
                }
            }
            StreamEvent::MessageStart { message } => {
                self.message = message;
                Ok(None)
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    let current = &mut self.message.usage;
                    current.input_tokens = current.input_tokens.max(usage.input_tokens);
                    current.output_tokens = usage.output_tokens;
                    current.cache_creation_input_tokens = current
                        .cache_creation_input_tokens
                        .max(usage.cache_creation_input_tokens);
                    current.cache_read_input_tokens = current
                        .cache_read_input_tokens
                        .max(usage.cache_read_input_tokens);
                }
                if delta.stop_reason.is_some() {
                    self.message.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.message.stop_sequence = delta.stop_sequence;
                }
                Ok(None)
            }
            StreamEvent::ContentBlockStart {
                common,
                content_block,
            } => {
                if common.index != self.blocks.len() {
                    return Err(anyhow!(
                        "Start index {} does not match expected block {}",
                        common.index,
                        self.blocks.len()
                    ));
                }
                if self.block_open {
                    self.close_block()?;
                }
                self.start_block(content_block);
                Ok(None)
            }
            StreamEvent::ContentBlockDelta { common, delta } => {
                self.check_open_index(common.index)?;
                Ok(self.apply_delta(delta))
            }
            StreamEvent::ContentBlockStop { common } => {
                self.check_open_index(common.index)?;
                self.close_block()?;
                Ok(None)
            }
            StreamEvent::MessageStop | StreamEvent::Ping => Ok(None),
            StreamEvent::Unknown => {
                debug!("Ignoring unknown stream event");
                Ok(None)
            }
        }
    }

    fn check_open_index(&self, index: usize) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(anyhow!("Received Delta/Stop but no blocks exist"));
        }
        if index != self.blocks.len() - 1 {
            return Err(anyhow!(
                "Delta/Stop index {} does not match current block {}",
                index,
                self.blocks.len() - 1
            ));
        }
        if !self.block_open {
            return Err(anyhow!("Block {index} is already closed"));
        }
        Ok(())
    }

    fn start_block(&mut self, content_block: StreamContentBlock) {
        self.current_content.clear();
        let block = match content_block.block_type.as_str() {
            "thinking" => {
                self.current_content
                    .push_str(content_block.thinking.as_deref().unwrap_or_default());
                ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: content_block.signature.unwrap_or_default(),
                }
            }
            "redacted_thinking" => ContentBlock::RedactedThinking {
                data: content_block.data.unwrap_or_default(),
            },
            "text" => {
                self.current_content
                    .push_str(content_block.text.as_deref().unwrap_or_default());
                ContentBlock::text("")
            }
            "tool_use" => {
                let id = content_block.id.unwrap_or_default();
                let name = content_block.name.unwrap_or_default();
                debug!("Creating ToolUse block with id={:?}, name={:?}", id, name);
                ContentBlock::ToolUse {
                    id,
                    name,
                    input: content_block.input.unwrap_or(Value::Null),
                }
            }
            other => {
                warn!("Unsupported content block type '{other}', treating as text");
                ContentBlock::text("")
            }
        };
        self.blocks.push(block);
        self.block_open = true;
    }

    fn apply_delta(&mut self, delta: ContentDelta) -> Option<StreamingChunk> {
        match delta {
            ContentDelta::Thinking { thinking } => {
                self.current_content.push_str(&thinking);
                Some(StreamingChunk::Thinking(thinking))
            }
            ContentDelta::Signature {
                signature: signature_delta,
            } => {
                if let Some(ContentBlock::Thinking { signature, .. }) = self.blocks.last_mut() {
                    signature.push_str(&signature_delta);
                }
                None
            }
            ContentDelta::Text { text } => {
                self.current_content.push_str(&text);
                Some(StreamingChunk::Text(text))
            }
            ContentDelta::InputJson { partial_json } => {
                let (tool_name, tool_id) = match self.blocks.last() {
                    Some(ContentBlock::ToolUse { name, id, .. }) => {
                        (Some(name.clone()), Some(id.clone()))
                    }
                    _ => {
                        warn!("Last block is not a ToolUse type!");
                        (None, None)
                    }
                };
                self.current_content.push_str(&partial_json);
                Some(StreamingChunk::InputJson {
                    content: partial_json,
                    tool_name,
                    tool_id,
                })
            }
            ContentDelta::Citations { citation } => {
                if let Some(ContentBlock::Text { citations, .. }) = self.blocks.last_mut() {
                    match citations.get_or_insert_with(|| Value::Array(Vec::new())) {
                        Value::Array(list) => list.push(citation),
                        other => *other = Value::Array(vec![citation]),
                    }
                }
                None
            }
        }
    }

    fn close_block(&mut self) -> Result<()> {
        self.block_open = false;
        let content = std::mem::take(&mut self.current_content);
        match self.blocks.last_mut() {
            Some(ContentBlock::Thinking { thinking, .. }) => *thinking = content,
            Some(ContentBlock::Text { text, .. }) => *text = content,
            Some(ContentBlock::ToolUse { input, name, .. }) => {
                *input = parse_tool_input(&content, input)
                    .map_err(|e| anyhow!("Invalid JSON input for tool '{name}': {e}"))?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Flush buffered data, close a dangling block and return the final message
    pub fn finish(mut self) -> Result<ProviderMessage> {
        if !self.line_buffer.is_empty() {
            let line = String::from_utf8(std::mem::take(&mut self.line_buffer))?;
            self.process_line(line.trim_end_matches('\r'))?;
        }
        if self.block_open {
            warn!("Stream ended with an unterminated content block");
            if let Some(ContentBlock::ToolUse { input, .. }) = self.blocks.last_mut() {
                let content = std::mem::take(&mut self.current_content);
                *input = parse_tool_input(&content, input).unwrap_or_else(|e| {
                    warn!("Discarding incomplete tool input: {e}");
                    Value::Object(Default::default())
                });
                self.block_open = false;
            } else {
                self.close_block()?;
            }
        }
        if let Some(recorder) = &self.recorder {
            recorder.end_recording()?;
        }
        self.message.content = self.blocks;
        Ok(self.message)
    }
}

/// Accumulated partial JSON wins over the start event's input; empty means `{}`
fn parse_tool_input(partial: &str, start_input: &Value) -> serde_json::Result<Value> {
    if partial.trim().is_empty() {
        return Ok(match start_input {
            Value::Object(map) if !map.is_empty() => start_input.clone(),
            _ => Value::Object(Default::default()),
        });
    }
    serde_json::from_str(partial)
}

/// Parse a non-streaming response body
pub fn parse_message(body: &str) -> Result<ProviderMessage> {
    serde_json::from_str(body)
        .map_err(|e| ApiErrorContext::from(ApiError::Unknown(format!("Failed to parse response: {e}"))).into())
}
