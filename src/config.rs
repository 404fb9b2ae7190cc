//! Settings resolution for the Vertex client.
//!
//! Values come from explicit overrides, then environment variables, then
//! `~/.config/vertex-claude/config.json`, then the ADC quota project.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_REGION: &str = "europe-west1";
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const PROJECT_ENV_VARS: &[&str] = &["ANTHROPIC_VERTEX_PROJECT_ID", "GOOGLE_CLOUD_PROJECT"];
pub const REGION_ENV_VARS: &[&str] = &["CLOUD_ML_REGION", "GOOGLE_CLOUD_REGION", "GCP_REGION"];
pub const TOKEN_ENV_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Read access to environment variables
pub trait Env: Send + Sync {
    /// Value of `key`, with empty values treated as unset
    fn var(&self, key: &str) -> Option<String>;

    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.var(key))
    }
}

/// The process environment
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }
}

impl Env for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|value| !value.is_empty()).cloned()
    }
}

/// Regions look like `europe-west1` or `us-central1`; `global` is also accepted
pub fn is_valid_region(region: &str) -> bool {
    Regex::new(r"^(global|[a-z]+(-[a-z]+)+[0-9]+)$").is_ok_and(|pattern| pattern.is_match(region))
}

/// Contents of the optional JSON config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub base_url: Option<String>,
    pub max_retries: Option<u32>,
}

impl ConfigFile {
    /// Default location, `~/.config/vertex-claude/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(".config")
                .join("vertex-claude")
                .join("config.json")
        })
    }

    /// Load the file if it exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(Some(config))
    }
}

/// Values given explicitly on the command line or by a library caller
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub base_url: Option<String>,
    pub access_token: Option<String>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexSettings {
    pub project_id: String,
    pub region: String,
    /// Replaces the `https://{region}-aiplatform.googleapis.com` host part
    pub base_url: Option<String>,
    /// Pre-issued bearer token; skips ADC and gcloud
    pub access_token: Option<String>,
    pub max_retries: u32,
}

impl VertexSettings {
    /// Resolve against the process environment, the default config file and ADC
    pub fn resolve(overrides: SettingsOverrides, env: &dyn Env) -> Result<Self> {
        let file = match ConfigFile::default_path() {
            Some(path) => ConfigFile::load(&path)?,
            None => None,
        };
        let adc_project = crate::llm::credentials::adc_path(env)
            .and_then(|path| crate::llm::credentials::AdcCredentials::load(&path).ok())
            .and_then(|creds| creds.quota_project_id);
        Self::resolve_from(overrides, env, file.unwrap_or_default(), adc_project)
    }

    pub fn resolve_from(
        overrides: SettingsOverrides,
        env: &dyn Env,
        file: ConfigFile,
        adc_project: Option<String>,
    ) -> Result<Self> {
        let project_id = overrides
            .project_id
            .or_else(|| env.first_of(PROJECT_ENV_VARS))
            .or(file.project_id)
            .or(adc_project)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No Google Cloud project configured. Set ANTHROPIC_VERTEX_PROJECT_ID or \
                     GOOGLE_CLOUD_PROJECT, pass --project, or run `vertex-claude setup`"
                )
            })?;

        let region = overrides
            .region
            .or_else(|| env.first_of(REGION_ENV_VARS))
            .or(file.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        if !is_valid_region(&region) {
            anyhow::bail!("Invalid region '{region}'");
        }

        let settings = Self {
            project_id,
            region,
            base_url: overrides.base_url.or(file.base_url),
            access_token: overrides.access_token.or_else(|| env.var(TOKEN_ENV_VAR)),
            max_retries: overrides
                .max_retries
                .or(file.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
        };
        debug!(
            "Resolved Vertex settings: project={}, region={}",
            settings.project_id, settings.region
        );
        Ok(settings)
    }
}
