use crate::config::VertexSettings;
use crate::llm::auth::TokenManager;
use crate::llm::convert::{beta_flags, build_request_body};
use crate::llm::models::ModelInfo;
use crate::llm::prompt::{Prompt, Tool, ToolCall, ToolResult};
use crate::llm::recording::{APIRecorder, PlaybackState};
use crate::llm::response::{ChainResponse, Conversation, Response, STRUCTURED_OUTPUT_TOOL};
use crate::llm::stream::{parse_message, StreamAccumulator};
use crate::llm::streaming::{ChunkStream, HttpChunkStream, PlaybackChunkStream};
use crate::llm::types::{ApiError, ApiErrorContext, ContentBlock, ProviderMessage};
use crate::llm::{utils, StreamingCallback, StreamingChunk};
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of responses a tool chain may produce
pub const DEFAULT_CHAIN_LIMIT: usize = 10;

/// Final message plus the visible text chunks in arrival order
type Exchange = (ProviderMessage, Vec<String>);

pub struct VertexClaude {
    client: Client,
    model: &'static ModelInfo,
    settings: VertexSettings,
    token_manager: Arc<TokenManager>,
    recorder: Option<APIRecorder>,
    playback: Option<PlaybackState>,
}

impl VertexClaude {
    pub fn new(
        model: &'static ModelInfo,
        settings: VertexSettings,
        token_manager: Arc<TokenManager>,
    ) -> Self {
        Self {
            client: Client::new(),
            model,
            settings,
            token_manager,
            recorder: None,
            playback: None,
        }
    }

    pub fn with_recorder<P: AsRef<std::path::Path>>(mut self, recording_path: P) -> Self {
        self.recorder = Some(APIRecorder::new(recording_path));
        self
    }

    pub fn with_playback(mut self, playback_state: PlaybackState) -> Self {
        self.playback = Some(playback_state);
        self
    }

    pub fn model(&self) -> &'static ModelInfo {
        self.model
    }

    /// Raw predict URL for the model, streaming or not
    pub fn endpoint(&self, stream: bool) -> String {
        let host = match &self.settings.base_url {
            Some(base_url) => base_url.trim_end_matches('/').to_string(),
            None if self.settings.region == "global" => {
                "https://aiplatform.googleapis.com".to_string()
            }
            None => format!("https://{}-aiplatform.googleapis.com", self.settings.region),
        };
        let method = if stream {
            "streamRawPredict"
        } else {
            "rawPredict"
        };
        format!(
            "{host}/v1/projects/{}/locations/{}/publishers/anthropic/models/{}:{method}",
            self.settings.project_id, self.settings.region, self.model.vertex_name
        )
    }

    /// Run a single prompt. Streams when a callback is given.
    pub async fn prompt(
        &self,
        prompt: Prompt,
        conversation: Option<&Conversation>,
        streaming_callback: Option<&StreamingCallback>,
    ) -> Result<Response> {
        prompt.options.validate(self.model)?;

        let stream = streaming_callback.is_some();
        let body = build_request_body(self.model, &prompt, conversation, stream)?;
        debug!("Request body: {}", body);

        let mut chunks = Vec::new();
        if let Some(prefill) = prompt
            .options
            .prefill
            .as_deref()
            .map(str::trim_end)
            .filter(|prefill| !prefill.is_empty() && !prompt.options.hide_prefill)
        {
            if let Some(callback) = streaming_callback {
                callback(&StreamingChunk::Text(prefill.to_string()))?;
            }
            chunks.push(prefill.to_string());
        }

        let (message, text) = self
            .send_with_retry(&body, stream, &beta_flags(&prompt), streaming_callback)
            .await?;
        chunks.extend(text);

        Ok(Response::new(prompt, self.model.model_id, &message).with_chunks(chunks))
    }

    /// Run a prompt and keep answering its tool calls until none remain.
    ///
    /// Every response is appended to `conversation`. A `chain_limit` of 0
    /// means no limit.
    pub async fn chain(
        &self,
        prompt: Prompt,
        conversation: &mut Conversation,
        chain_limit: usize,
        streaming_callback: Option<&StreamingCallback>,
    ) -> Result<ChainResponse> {
        let mut chain = ChainResponse::default();
        let mut next = Some(prompt);

        while let Some(current) = next.take() {
            if chain_limit > 0 && chain.responses.len() >= chain_limit {
                anyhow::bail!("Chain limit of {chain_limit} exceeded");
            }
            let response = self
                .prompt(current, Some(&*conversation), streaming_callback)
                .await?;

            if !response.tool_calls().is_empty() {
                let results = response
                    .tool_calls()
                    .iter()
                    .map(|call| execute_tool(&response.prompt.tools, call))
                    .collect();
                next = Some(response.prompt.follow_up(results));
            }

            conversation.push(response.clone());
            chain.responses.push(response);
        }

        Ok(chain)
    }

    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        stream: bool,
        betas: &[&str],
        streaming_callback: Option<&StreamingCallback>,
    ) -> Result<Exchange> {
        if let Some(playback) = &self.playback {
            return self.playback_request(playback, streaming_callback).await;
        }

        let mut attempts = 0;
        let mut token_refreshed = false;

        loop {
            match self
                .try_send_request(body, stream, betas, streaming_callback)
                .await
            {
                Ok(exchange) => return Ok(exchange),
                Err(e) => {
                    if !token_refreshed && is_authentication_error(&e) {
                        warn!("Access token rejected, retrying with a fresh token");
                        self.token_manager.invalidate().await;
                        token_refreshed = true;
                        continue;
                    }
                    if utils::handle_retryable_error(
                        &e,
                        attempts,
                        self.settings.max_retries,
                        streaming_callback,
                    )
                    .await
                    {
                        attempts += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn playback_request(
        &self,
        playback: &PlaybackState,
        streaming_callback: Option<&StreamingCallback>,
    ) -> Result<Exchange> {
        let session = playback
            .next_session()
            .ok_or_else(|| anyhow::anyhow!("No more recorded sessions available"))?;

        debug!("Playing back session with {} chunks", session.chunks.len());

        let streamed = session
            .endpoint
            .as_deref()
            .map_or(streaming_callback.is_some(), |endpoint| {
                endpoint.ends_with(":streamRawPredict")
            });

        if streamed {
            let mut chunk_stream = PlaybackChunkStream::new(session.chunks, playback.fast);
            process_chunk_stream(&mut chunk_stream, None, streaming_callback).await
        } else {
            let body: String = session.chunks.iter().map(|c| c.data.as_str()).collect();
            visible_text(parse_message(&body)?, streaming_callback)
        }
    }

    async fn try_send_request(
        &self,
        body: &serde_json::Value,
        stream: bool,
        betas: &[&str],
        streaming_callback: Option<&StreamingCallback>,
    ) -> Result<Exchange> {
        let endpoint = self.endpoint(stream);

        // Start recording before the request to capture real latency
        if let Some(recorder) = &self.recorder {
            recorder.start_recording(body.clone(), &endpoint)?;
        }

        let token = self.token_manager.get_valid_token().await?;

        let mut request_builder = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .header(
                "accept",
                if stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            );
        if !betas.is_empty() {
            request_builder = request_builder.header("anthropic-beta", betas.join(","));
        }

        let response = request_builder
            .json(body)
            .send()
            .await
            .map_err(|e| ApiErrorContext::from(ApiError::NetworkError(e.to_string())))?;

        debug!("Response headers: {:?}", response.headers());
        let response = utils::check_response_error(response).await?;

        if stream {
            let mut chunk_stream = HttpChunkStream::new(response);
            process_chunk_stream(&mut chunk_stream, self.recorder.clone(), streaming_callback)
                .await
        } else {
            let response_text = response
                .text()
                .await
                .map_err(|e| ApiErrorContext::from(ApiError::NetworkError(e.to_string())))?;

            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.record_chunk(&response_text) {
                    warn!("Failed to record non-streaming response: {e}");
                }
                if let Err(e) = recorder.end_recording() {
                    warn!("Failed to end recording: {e}");
                }
            }

            visible_text(parse_message(&response_text)?, streaming_callback)
        }
    }
}

fn is_authentication_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiErrorContext>()
        .is_some_and(|ctx| matches!(ctx.error, ApiError::Authentication(_)))
}

/// Forward a chunk; structured output JSON counts as visible text
fn forward_chunk(
    chunk: StreamingChunk,
    visible: &mut Vec<String>,
    streaming_callback: Option<&StreamingCallback>,
) -> Result<()> {
    let chunk = match chunk {
        StreamingChunk::InputJson {
            content,
            tool_name: Some(name),
            ..
        } if name == STRUCTURED_OUTPUT_TOOL => StreamingChunk::Text(content),
        other => other,
    };
    if let StreamingChunk::Text(text) = &chunk {
        visible.push(text.clone());
    }
    if let Some(callback) = streaming_callback {
        callback(&chunk)?;
    }
    Ok(())
}

async fn process_chunk_stream(
    chunk_stream: &mut dyn ChunkStream,
    recorder: Option<APIRecorder>,
    streaming_callback: Option<&StreamingCallback>,
) -> Result<Exchange> {
    debug!("Starting streaming response processing");
    let mut accumulator = StreamAccumulator::new().with_recorder(recorder);
    let mut visible = Vec::new();
    let mut delivered = false;

    loop {
        let chunk = match chunk_stream.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Err(interrupted(e, delivered)),
        };
        // One line at a time, so events before a failing one still reach the caller
        for line in chunk.split_inclusive(|&byte| byte == b'\n') {
            let streamed = accumulator
                .process_bytes(line)
                .map_err(|e| interrupted(e, delivered))?;
            for chunk in streamed {
                forward_chunk(chunk, &mut visible, streaming_callback)?;
                delivered |= streaming_callback.is_some();
            }
        }
    }

    Ok((accumulator.finish()?, visible))
}

/// Once output has reached the caller a stream must not be replayed, so API
/// errors lose their retryable type.
fn interrupted(error: anyhow::Error, delivered: bool) -> anyhow::Error {
    if !delivered || error.downcast_ref::<ApiErrorContext>().is_none() {
        return error;
    }
    warn!("Stream failed after output was delivered: {error}");
    anyhow::anyhow!("Stream interrupted after partial output: {error}")
}

/// Visible text of a complete message, also handed to the callback if any
fn visible_text(
    message: ProviderMessage,
    streaming_callback: Option<&StreamingCallback>,
) -> Result<Exchange> {
    let mut visible = Vec::new();
    for block in &message.content {
        let chunk = match block {
            ContentBlock::Text { text, .. } if !text.is_empty() => {
                StreamingChunk::Text(text.clone())
            }
            ContentBlock::ToolUse { name, input, .. } if name == STRUCTURED_OUTPUT_TOOL => {
                StreamingChunk::Text(input.to_string())
            }
            _ => continue,
        };
        forward_chunk(chunk, &mut visible, streaming_callback)?;
    }
    Ok((message, visible))
}

/// Run the tool a call refers to. Failures become error results.
pub fn execute_tool(tools: &[Tool], call: &ToolCall) -> ToolResult {
    let outcome = match tools.iter().find(|tool| tool.name == call.name) {
        None => Err(format!("Error: tool \"{}\" does not exist", call.name)),
        Some(Tool {
            implementation: None,
            ..
        }) => Err(format!(
            "Error: tool \"{}\" has no implementation",
            call.name
        )),
        Some(Tool {
            implementation: Some(function),
            ..
        }) => (**function)(call.arguments.clone()).map_err(|e| format!("Error: {e}")),
    };

    match outcome {
        Ok(output) => ToolResult::for_call(call, output),
        Err(message) => {
            warn!("Tool call {} failed: {}", call.name, message);
            ToolResult {
                is_error: true,
                ..ToolResult::for_call(call, message)
            }
        }
    }
}
