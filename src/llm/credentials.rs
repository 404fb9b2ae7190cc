//! Application Default Credentials (ADC) discovery.
//!
//! ## Lookup order
//!
//! 1. `GOOGLE_APPLICATION_CREDENTIALS`, when the file it names exists
//! 2. `%APPDATA%\gcloud\application_default_credentials.json` on Windows,
//!    `~/.config/gcloud/application_default_credentials.json` elsewhere

use crate::config::Env;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

const ADC_FILE: &str = "application_default_credentials.json";

/// Location of the ADC file, if one exists
pub fn adc_path(env: &dyn Env) -> Option<PathBuf> {
    if let Some(path) = env.var("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from) {
        if path.exists() {
            return Some(path);
        }
        debug!(path = %path.display(), "GOOGLE_APPLICATION_CREDENTIALS points to a missing file");
    }

    let default_path = if cfg!(windows) {
        PathBuf::from(env.var("APPDATA").unwrap_or_default())
            .join("gcloud")
            .join(ADC_FILE)
    } else {
        dirs::home_dir()?.join(".config").join("gcloud").join(ADC_FILE)
    };
    default_path.exists().then_some(default_path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    User,
    ServiceAccount,
    Other,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialKind::User => "user",
            CredentialKind::ServiceAccount => "service_account",
            CredentialKind::Other => "other",
        })
    }
}

/// Fields of an ADC file this crate cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdcCredentials {
    #[serde(rename = "type")]
    pub credential_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub quota_project_id: Option<String>,
    pub client_email: Option<String>,
    /// RFC 3339 timestamp some tools write for user credentials
    pub expiry: Option<String>,
}

impl AdcCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials {}", path.display()))
    }

    /// Has everything needed for a refresh-token grant
    pub fn has_oauth(&self) -> bool {
        self.credential_type.as_deref() == Some("authorized_user")
            && self.client_id.is_some()
            && self.client_secret.is_some()
            && self.refresh_token.is_some()
    }
}

/// Whether the credentials are still usable, and what kind they are.
///
/// Service accounts never expire. User credentials expire only when an
/// `expiry` is present, parseable and in the past.
pub fn check_credential_expiry(
    creds: &AdcCredentials,
    now: DateTime<Utc>,
) -> (bool, CredentialKind) {
    match creds.credential_type.as_deref() {
        Some("service_account") => (true, CredentialKind::ServiceAccount),
        Some("authorized_user") => {
            let expired = creds
                .expiry
                .as_deref()
                .and_then(|expiry| DateTime::parse_from_rfc3339(expiry).ok())
                .is_some_and(|expiry| expiry < now);
            (!expired, CredentialKind::User)
        }
        _ => (true, CredentialKind::Other),
    }
}
