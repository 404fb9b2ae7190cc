use crate::llm::models::ModelInfo;
use serde::{Deserialize, Serialize};

/// Minimum token budget Anthropic accepts for extended thinking
pub const MIN_THINKING_BUDGET: u32 = 1024;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OptionsError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Only one of temperature and top_p can be set")]
    TemperatureAndTopP,

    #[error("Model {0} does not support thinking")]
    ThinkingUnsupported(String),

    #[error("max_tokens ({max_tokens}) must be greater than thinking_budget ({budget})")]
    BudgetExceedsMaxTokens { max_tokens: u32, budget: u32 },

    #[error("{0} cannot be combined with thinking")]
    IncompatibleWithThinking(&'static str),
}

/// Per-prompt options understood by the Claude models
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub user_id: Option<String>,
    /// Text the assistant reply is forced to start with
    pub prefill: Option<String>,
    /// Do not repeat the prefill at the start of the output
    #[serde(default)]
    pub hide_prefill: bool,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Mark the prompt for prompt caching
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub thinking: bool,
    pub thinking_budget: Option<u32>,
}

fn invalid(key: &str, reason: impl Into<String>) -> OptionsError {
    OptionsError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, OptionsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

fn parse_unit_interval(key: &str, value: &str) -> Result<f64, OptionsError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a number, got '{value}'")))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(invalid(key, "must be between 0 and 1"));
    }
    Ok(parsed)
}

fn parse_positive(key: &str, value: &str) -> Result<u32, OptionsError> {
    let parsed: u32 = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a positive integer, got '{value}'")))?;
    if parsed == 0 {
        return Err(invalid(key, "must be greater than 0"));
    }
    Ok(parsed)
}

/// Stop sequences may be given as a JSON list or as a single plain string
fn parse_stop_sequences(value: &str) -> Result<Vec<String>, OptionsError> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(trimmed)
            .map_err(|e| invalid("stop_sequences", e.to_string()));
    }
    Ok(vec![value.to_string()])
}

impl ClaudeOptions {
    /// Parse `-o key value` pairs as given on the command line
    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(
        pairs: &[(K, V)],
    ) -> Result<Self, OptionsError> {
        let mut options = ClaudeOptions::default();
        for (key, value) in pairs {
            options.set(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
        match key {
            "max_tokens" => self.max_tokens = Some(parse_positive(key, value)?),
            "temperature" => self.temperature = Some(parse_unit_interval(key, value)?),
            "top_p" => self.top_p = Some(parse_unit_interval(key, value)?),
            "top_k" => self.top_k = Some(parse_positive(key, value)?),
            "user_id" => self.user_id = Some(value.to_string()),
            "prefill" => self.prefill = Some(value.to_string()),
            "hide_prefill" => self.hide_prefill = parse_bool(key, value)?,
            "stop_sequences" => self.stop_sequences = parse_stop_sequences(value)?,
            "cache" => self.cache = parse_bool(key, value)?,
            "thinking" => self.thinking = parse_bool(key, value)?,
            "thinking_budget" => {
                let budget = parse_positive(key, value)?;
                if budget < MIN_THINKING_BUDGET {
                    return Err(invalid(
                        key,
                        format!("must be at least {MIN_THINKING_BUDGET}"),
                    ));
                }
                self.thinking_budget = Some(budget);
            }
            other => return Err(OptionsError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn resolved_max_tokens(&self, model: &ModelInfo) -> u32 {
        self.max_tokens.unwrap_or(model.default_max_tokens)
    }

    pub fn resolved_thinking_budget(&self) -> u32 {
        self.thinking_budget.unwrap_or(MIN_THINKING_BUDGET)
    }

    /// Check option combinations against what the model and the API accept
    pub fn validate(&self, model: &ModelInfo) -> Result<(), OptionsError> {
        if self.max_tokens == Some(0) {
            return Err(invalid("max_tokens", "must be greater than 0"));
        }
        if self.temperature.is_some() && self.top_p.is_some() {
            return Err(OptionsError::TemperatureAndTopP);
        }
        if let Some(budget) = self.thinking_budget {
            if budget < MIN_THINKING_BUDGET {
                return Err(invalid(
                    "thinking_budget",
                    format!("must be at least {MIN_THINKING_BUDGET}"),
                ));
            }
        }
        if self.thinking {
            if !model.supports_thinking {
                return Err(OptionsError::ThinkingUnsupported(
                    model.model_id.to_string(),
                ));
            }
            let budget = self.resolved_thinking_budget();
            let max_tokens = self.resolved_max_tokens(model);
            if max_tokens <= budget {
                return Err(OptionsError::BudgetExceedsMaxTokens { max_tokens, budget });
            }
            if self.top_k.is_some() {
                return Err(OptionsError::IncompatibleWithThinking("top_k"));
            }
            if self.prefill.is_some() {
                return Err(OptionsError::IncompatibleWithThinking("prefill"));
            }
        }
        Ok(())
    }
}
