//! Translation from the host prompt/conversation model into Anthropic
//! messages request bodies as accepted by Vertex AI's `rawPredict`.

use crate::llm::models::ModelInfo;
use crate::llm::prompt::{AttachmentSource, Prompt};
use crate::llm::response::{Conversation, Response, STRUCTURED_OUTPUT_TOOL};
use crate::llm::types::{ContentBlock, MediaSource, Message, MessageContent, MessageRole};
use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

/// API version Vertex expects in place of the `anthropic-version` header
pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// Beta flag needed for thinking between tool calls
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

fn ephemeral() -> Value {
    json!({"type": "ephemeral"})
}

/// Build the user turn for a prompt. Tool results that lack an id are matched by
/// name, in order, against the tool calls of the response they answer.
fn user_blocks(
    prompt: &Prompt,
    answered: Option<&Response>,
    model: &ModelInfo,
) -> Result<Vec<ContentBlock>> {
    let mut blocks = Vec::new();
    let mut used_ids: HashSet<String> = prompt
        .tool_results
        .iter()
        .filter_map(|result| result.tool_call_id.clone())
        .collect();

    for result in &prompt.tool_results {
        let tool_use_id = match &result.tool_call_id {
            Some(id) => id.clone(),
            None => {
                let call = answered
                    .into_iter()
                    .flat_map(|response| response.tool_calls())
                    .find(|call| {
                        call.name == result.name
                            && call
                                .tool_call_id
                                .as_ref()
                                .is_some_and(|id| !used_ids.contains(id))
                    })
                    .ok_or_else(|| {
                        anyhow!("No pending tool call matches result for '{}'", result.name)
                    })?;
                // Filtered on is_some above
                let id = call.tool_call_id.clone().unwrap_or_default();
                used_ids.insert(id.clone());
                id
            }
        };
        blocks.push(ContentBlock::ToolResult {
            tool_use_id,
            content: result.output.clone(),
            is_error: result.is_error.then_some(true),
        });
    }

    for attachment in &prompt.attachments {
        let media_type = attachment
            .resolve_type()
            .ok_or_else(|| anyhow!("Could not determine attachment type"))?;
        let source = match &attachment.source {
            AttachmentSource::Content(_) => MediaSource::Base64 {
                media_type: media_type.clone(),
                data: attachment.base64_content().unwrap_or_default(),
            },
            AttachmentSource::Url(url) => MediaSource::Url { url: url.clone() },
        };
        let block = match media_type.as_str() {
            "image/png" | "image/jpeg" | "image/gif" | "image/webp" => {
                if !model.supports_images {
                    bail!("Model {} does not accept image attachments", model.model_id);
                }
                ContentBlock::Image { source }
            }
            "application/pdf" => {
                if !model.supports_pdf {
                    bail!("Model {} does not accept PDF attachments", model.model_id);
                }
                ContentBlock::Document { source }
            }
            other => bail!("Unsupported attachment type: {other}"),
        };
        blocks.push(block);
    }

    if let Some(text) = prompt.prompt.as_deref().filter(|text| !text.is_empty()) {
        blocks.push(ContentBlock::text(text));
    }

    Ok(blocks)
}

/// Replay a previous response as the assistant turn.
fn assistant_blocks(response: &Response) -> Vec<ContentBlock> {
    let mut blocks: Vec<ContentBlock> = if response.content.is_empty() {
        let mut fallback = Vec::new();
        let text = response.text();
        if !text.is_empty() {
            fallback.push(ContentBlock::text(text));
        }
        for (i, call) in response.tool_calls().iter().enumerate() {
            fallback.push(ContentBlock::ToolUse {
                id: call
                    .tool_call_id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}_{i}", call.name)),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }
        return fallback;
    } else {
        response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                    Some(block.clone())
                }
                ContentBlock::Text { text, .. } if !text.is_empty() => {
                    Some(ContentBlock::text(text.clone()))
                }
                ContentBlock::ToolUse { name, input, .. } if name == STRUCTURED_OUTPUT_TOOL => {
                    Some(ContentBlock::text(input.to_string()))
                }
                ContentBlock::ToolUse { .. } => Some(block.clone()),
                _ => None,
            })
            .collect()
    };

    // The model continued from the prefill, so the turn really started with it
    if let Some(prefill) = response
        .prompt
        .options
        .prefill
        .as_deref()
        .map(str::trim_end)
        .filter(|prefill| !prefill.is_empty())
    {
        match blocks
            .iter_mut()
            .find(|block| matches!(block, ContentBlock::Text { .. }))
        {
            Some(ContentBlock::Text { text, .. }) => text.insert_str(0, prefill),
            _ => blocks.insert(0, ContentBlock::text(prefill)),
        }
    }

    blocks
}

/// Build the full message list for a prompt following an optional conversation
pub fn build_messages(
    prompt: &Prompt,
    conversation: Option<&Conversation>,
    model: &ModelInfo,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    let mut previous: Option<&Response> = None;

    for response in conversation.into_iter().flat_map(|c| c.responses.iter()) {
        let blocks = user_blocks(&response.prompt, previous, model)?;
        if !blocks.is_empty() {
            messages.push(Message::user(blocks));
        }
        let blocks = assistant_blocks(response);
        if !blocks.is_empty() {
            messages.push(Message::assistant(blocks));
        }
        previous = Some(response);
    }

    let blocks = user_blocks(prompt, previous, model)?;
    if blocks.is_empty() {
        bail!("Prompt has no text, attachments or tool results");
    }
    messages.push(Message::user(blocks));

    if let Some(prefill) = prompt
        .options
        .prefill
        .as_deref()
        .map(str::trim_end)
        .filter(|prefill| !prefill.is_empty())
    {
        messages.push(Message {
            role: MessageRole::Assistant,
            content: MessageContent::Text(prefill.to_string()),
        });
    }

    Ok(messages)
}

/// Mark the last content block of the last user message for caching
fn mark_cache_breakpoint(messages: &mut Value) {
    let Some(messages) = messages.as_array_mut() else {
        return;
    };
    let Some(last_user) = messages
        .iter_mut()
        .rev()
        .find(|message| message["role"] == "user")
    else {
        return;
    };
    if let Some(block) = last_user["content"]
        .as_array_mut()
        .and_then(|blocks| blocks.last_mut())
        .and_then(Value::as_object_mut)
    {
        block.insert("cache_control".to_string(), ephemeral());
    }
}

/// Assemble the request body for Vertex's raw predict endpoints.
///
/// The model is not part of the body; Vertex routes on the URL.
pub fn build_request_body(
    model: &ModelInfo,
    prompt: &Prompt,
    conversation: Option<&Conversation>,
    stream: bool,
) -> Result<Value> {
    let options = &prompt.options;

    if prompt.schema.is_some() && options.thinking {
        bail!("A schema cannot be combined with thinking");
    }

    let mut messages = serde_json::to_value(build_messages(prompt, conversation, model)?)?;
    if options.cache {
        mark_cache_breakpoint(&mut messages);
    }

    let mut body = json!({
        "anthropic_version": VERTEX_ANTHROPIC_VERSION,
        "max_tokens": options.resolved_max_tokens(model),
        "messages": messages,
        "stream": stream,
    });

    if let Some(system) = prompt.system.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = if options.cache {
            json!([{"type": "text", "text": system, "cache_control": ephemeral()}])
        } else {
            json!(system)
        };
    }

    if options.thinking {
        if options.temperature.is_some() {
            debug!("Dropping temperature, thinking requires the default");
        }
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": options.resolved_thinking_budget(),
        });
    } else if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = options.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(top_k) = options.top_k {
        body["top_k"] = json!(top_k);
    }
    if !options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(options.stop_sequences);
    }
    if let Some(user_id) = &options.user_id {
        body["metadata"] = json!({"user_id": user_id});
    }

    let mut tools: Vec<Value> = prompt
        .tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();

    if let Some(schema) = &prompt.schema {
        if !schema.is_object() {
            bail!("Schema must be a JSON object");
        }
        tools.push(json!({
            "name": STRUCTURED_OUTPUT_TOOL,
            "description": "Output the response as structured data matching the schema",
            "input_schema": schema,
        }));
        body["tool_choice"] = json!({"type": "tool", "name": STRUCTURED_OUTPUT_TOOL});
    } else if !tools.is_empty() {
        body["tool_choice"] = json!({"type": "auto"});
    }

    if !tools.is_empty() {
        if options.cache {
            if let Some(last) = tools.last_mut().and_then(Value::as_object_mut) {
                last.insert("cache_control".to_string(), ephemeral());
            }
        }
        body["tools"] = Value::Array(tools);
    }

    Ok(body)
}

/// `anthropic-beta` flags the request needs
pub fn beta_flags(prompt: &Prompt) -> Vec<&'static str> {
    let mut flags = Vec::new();
    if prompt.options.thinking && !prompt.tools.is_empty() {
        flags.push(INTERLEAVED_THINKING_BETA);
    }
    flags
}
