//! Claude on Vertex AI
//!
//! This module implements:
//! - The model registry and per-prompt options
//! - Translation of prompts and conversations into Anthropic request bodies
//! - Streaming and non-streaming response assembly
//! - Bearer token handling for Google Cloud
//! - Recording and playback of exchanges for debugging and testing

#[cfg(test)]
mod tests;

mod utils;

pub mod auth;
pub mod convert;
pub mod credentials;
pub mod models;
pub mod options;
pub mod prompt;
pub mod recording;
pub mod response;
pub mod stream;
pub mod streaming;
pub mod types;
pub mod vertex;

pub use auth::TokenManager;
pub use models::{find_model, register_models, ModelInfo};
pub use options::{ClaudeOptions, OptionsError};
pub use prompt::{Attachment, Prompt, Tool, ToolCall, ToolResult};
pub use response::{ChainResponse, Conversation, Response};
pub use types::*;
pub use vertex::VertexClaude;

use anyhow::Result;

/// Incremental output of a streaming request
#[derive(Debug, Clone)]
pub enum StreamingChunk {
    /// Regular text content
    Text(String),
    /// Extended thinking output
    Thinking(String),
    /// Partial JSON arguments of a tool call
    InputJson {
        content: String,
        tool_name: Option<String>,
        tool_id: Option<String>,
    },
    /// Rate limit hit, retrying after the given delay
    RateLimit { seconds_remaining: u64 },
}

/// Receives chunks as they arrive; returning an error aborts the request
pub type StreamingCallback = Box<dyn Fn(&StreamingChunk) -> Result<()> + Send + Sync>;
