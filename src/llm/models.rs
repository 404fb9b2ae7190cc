//! Registry of Claude models available through Vertex AI.
//!
//! The host tool addresses models by their `vertex-*` aliases; requests are
//! routed to the publisher model name, which on Vertex carries an `@<date>`
//! version suffix instead of the `-<date>` suffix used by the first-party API.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Name exposed to the host tool, e.g. `vertex-4.5-haiku`
    pub model_id: &'static str,
    /// Publisher model name on Vertex AI, e.g. `claude-haiku-4-5@20251001`
    pub vertex_name: &'static str,
    pub supports_images: bool,
    pub supports_pdf: bool,
    pub supports_thinking: bool,
    /// Used when the prompt does not set `max_tokens`
    pub default_max_tokens: u32,
}

const MODELS: &[ModelInfo] = &[
    ModelInfo {
        model_id: "vertex-3.5-haiku",
        vertex_name: "claude-3-5-haiku@20241022",
        supports_images: false,
        supports_pdf: false,
        supports_thinking: false,
        default_max_tokens: 8192,
    },
    ModelInfo {
        model_id: "vertex-3.7-sonnet",
        vertex_name: "claude-3-7-sonnet@20250219",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 64000,
    },
    ModelInfo {
        model_id: "vertex-4-sonnet",
        vertex_name: "claude-sonnet-4@20250514",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 64000,
    },
    ModelInfo {
        model_id: "vertex-4-opus",
        vertex_name: "claude-opus-4@20250514",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 32000,
    },
    ModelInfo {
        model_id: "vertex-4.1-opus",
        vertex_name: "claude-opus-4-1@20250805",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 32000,
    },
    ModelInfo {
        model_id: "vertex-4.5-sonnet",
        vertex_name: "claude-sonnet-4-5@20250929",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 64000,
    },
    ModelInfo {
        model_id: "vertex-4.5-haiku",
        vertex_name: "claude-haiku-4-5@20251001",
        supports_images: true,
        supports_pdf: true,
        supports_thinking: true,
        default_max_tokens: 64000,
    },
];

/// All models this adapter registers with the host tool
pub fn register_models() -> &'static [ModelInfo] {
    MODELS
}

/// Look up a model by its host alias or its Vertex publisher name
pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    MODELS
        .iter()
        .find(|model| model.model_id == name || model.vertex_name == name)
}
