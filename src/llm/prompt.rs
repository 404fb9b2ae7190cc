//! The host tool's prompt object model.

use crate::llm::options::ClaudeOptions;
use anyhow::{Context, Result};
use base64::engine::{general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Implementation backing a tool; receives the parsed arguments
pub type ToolFunction = Arc<dyn Fn(serde_json::Value) -> Result<String> + Send + Sync>;

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub implementation: Option<ToolFunction>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            implementation: None,
        }
    }

    /// Tool backed by a closure
    pub fn function<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            implementation: Some(Arc::new(f)),
        }
    }

    pub fn with_schema(mut self, input_schema: serde_json::Value) -> Self {
        self.input_schema = input_schema;
        self
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("implementation", &self.implementation.is_some())
            .finish()
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
    pub tool_call_id: Option<String>,
}

/// Output of a tool, sent back to the model in the next prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub output: String,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn for_call(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            output: output.into(),
            tool_call_id: call.tool_call_id.clone(),
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentSource {
    Content(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub source: AttachmentSource,
    pub mime_type: Option<String>,
}

impl Attachment {
    pub fn from_content(content: Vec<u8>) -> Self {
        Self {
            source: AttachmentSource::Content(content),
            mime_type: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source: AttachmentSource::Url(url.into()),
            mime_type: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        Ok(Self::from_content(content))
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Explicit MIME type, or one sniffed from the content's magic bytes,
    /// or guessed from the URL's extension
    pub fn resolve_type(&self) -> Option<String> {
        if let Some(mime_type) = &self.mime_type {
            return Some(mime_type.clone());
        }
        match &self.source {
            AttachmentSource::Content(bytes) => sniff_mime_type(bytes).map(str::to_string),
            AttachmentSource::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let extension = path.rsplit('.').next()?.to_ascii_lowercase();
                let mime = match extension.as_str() {
                    "png" => "image/png",
                    "jpg" | "jpeg" => "image/jpeg",
                    "gif" => "image/gif",
                    "webp" => "image/webp",
                    "pdf" => "application/pdf",
                    _ => return None,
                };
                Some(mime.to_string())
            }
        }
    }

    pub fn base64_content(&self) -> Option<String> {
        match &self.source {
            AttachmentSource::Content(bytes) => Some(general_purpose::STANDARD.encode(bytes)),
            AttachmentSource::Url(_) => None,
        }
    }
}

fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else {
        None
    }
}

/// A single prompt as handed over by the host tool
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub prompt: Option<String>,
    pub system: Option<String>,
    pub attachments: Vec<Attachment>,
    /// JSON schema the reply must conform to
    pub schema: Option<serde_json::Value>,
    pub tools: Vec<Tool>,
    pub tool_results: Vec<ToolResult>,
    pub options: ClaudeOptions,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            prompt: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: ClaudeOptions) -> Self {
        self.options = options;
        self
    }

    /// Follow-up prompt carrying tool results, inheriting tools, system and options
    pub fn follow_up(&self, tool_results: Vec<ToolResult>) -> Self {
        Self {
            prompt: None,
            system: self.system.clone(),
            attachments: Vec::new(),
            schema: None,
            tools: self.tools.clone(),
            tool_results,
            options: self.options.clone(),
        }
    }
}
