use crate::config::{Env, VertexSettings};
use crate::llm::credentials::{adc_path, AdcCredentials};
use crate::utils::command::{CommandExecutor, DefaultCommandExecutor};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Google OAuth2 token endpoint
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed for tokens printed by gcloud
const GCLOUD_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

pub struct AccessToken {
    pub token: String,
    /// None for tokens without a known lifetime
    pub expires_in: Option<Duration>,
}

/// Something that can mint bearer tokens for Vertex AI
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;

    fn name(&self) -> &'static str;
}

/// A fixed, externally issued token
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_in: None,
        })
    }

    fn name(&self) -> &'static str {
        "static token"
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Refresh-token grant using `authorized_user` ADC
pub struct AuthorizedUserTokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl AuthorizedUserTokenSource {
    pub fn from_credentials(creds: &AdcCredentials) -> Option<Self> {
        if !creds.has_oauth() {
            return None;
        }
        Some(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .ok()?,
            token_url: TOKEN_ENDPOINT.to_string(),
            client_id: creds.client_id.clone()?,
            client_secret: creds.client_secret.clone()?,
            refresh_token: creds.refresh_token.clone()?,
        })
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }
}

#[async_trait]
impl TokenSource for AuthorizedUserTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        tracing::debug!("Refreshing access token via {}", self.token_url);

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let res = self.http.post(&self.token_url).form(&params).send().await?;

        let status = res.status();
        if !status.is_success() {
            let error_text = res.text().await.unwrap_or_default();
            anyhow::bail!("Token request failed: {} - {}", status, error_text);
        }

        let token_response = res.json::<TokenResponse>().await?;
        Ok(AccessToken {
            token: token_response.access_token,
            expires_in: token_response.expires_in.map(Duration::from_secs),
        })
    }

    fn name(&self) -> &'static str {
        "application default credentials"
    }
}

/// Asks the gcloud CLI for a token, either for the active CLI account or
/// for the Application Default Credentials
pub struct GcloudTokenSource {
    executor: Arc<dyn CommandExecutor>,
    application_default: bool,
}

impl GcloudTokenSource {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            application_default: false,
        }
    }

    /// Mint tokens from the ADC file (service account keys, workload identity)
    pub fn application_default(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            application_default: true,
        }
    }

    fn args(&self) -> &'static [&'static str] {
        if self.application_default {
            &["auth", "application-default", "print-access-token"]
        } else {
            &["auth", "print-access-token"]
        }
    }
}

#[async_trait]
impl TokenSource for GcloudTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let args = self.args();
        let output = self.executor.execute("gcloud", args).await?;
        let token = output.stdout.trim();
        if !output.success || token.is_empty() {
            anyhow::bail!(
                "gcloud {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            );
        }
        Ok(AccessToken {
            token: token.to_string(),
            expires_in: Some(GCLOUD_TOKEN_LIFETIME),
        })
    }

    fn name(&self) -> &'static str {
        if self.application_default {
            "gcloud application default credentials"
        } else {
            "gcloud CLI"
        }
    }
}

struct TokenInfo {
    token: String,
    expires_at: Option<SystemTime>,
}

/// Caches the bearer token of a [`TokenSource`] until shortly before it expires
pub struct TokenManager {
    source: Box<dyn TokenSource>,
    current_token: RwLock<Option<TokenInfo>>,
}

impl TokenManager {
    pub fn new(source: Box<dyn TokenSource>) -> Self {
        Self {
            source,
            current_token: RwLock::new(None),
        }
    }

    /// Pick the first applicable source: a configured token, user ADC, then gcloud
    pub fn from_settings(settings: &VertexSettings, env: &dyn Env) -> Self {
        Self::from_settings_with(settings, env, Arc::new(DefaultCommandExecutor))
    }

    /// Like [`TokenManager::from_settings`], running gcloud through `executor`.
    ///
    /// Any ADC file that cannot do a refresh-token grant itself (service
    /// account keys, external accounts) is handed to
    /// `gcloud auth application-default print-access-token`. Without an ADC
    /// file the active gcloud account is used.
    pub fn from_settings_with(
        settings: &VertexSettings,
        env: &dyn Env,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        if let Some(token) = &settings.access_token {
            return Self::new(Box::new(StaticTokenSource::new(token.clone())));
        }
        let Some(path) = adc_path(env) else {
            return Self::new(Box::new(GcloudTokenSource::new(executor)));
        };
        let user_source = AdcCredentials::load(&path)
            .ok()
            .and_then(|creds| AuthorizedUserTokenSource::from_credentials(&creds));
        match user_source {
            Some(source) => Self::new(Box::new(source)),
            None => Self::new(Box::new(GcloudTokenSource::application_default(executor))),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub async fn get_valid_token(&self) -> Result<String> {
        if let Some(token_info) = self.current_token.read().await.as_ref() {
            let fresh = token_info
                .expires_at
                .map_or(true, |expires_at| SystemTime::now() < expires_at);
            if fresh {
                return Ok(token_info.token.clone());
            }
        }

        self.refresh_token().await
    }

    /// Drop the cached token, e.g. after the server rejected it
    pub async fn invalidate(&self) {
        *self.current_token.write().await = None;
    }

    async fn refresh_token(&self) -> Result<String> {
        tracing::debug!("Requesting new access token from {}", self.source.name());
        let access_token = self.source.fetch_token().await?;

        let expires_at = access_token
            .expires_in
            .map(|lifetime| SystemTime::now() + lifetime.saturating_sub(EXPIRY_MARGIN));

        *self.current_token.write().await = Some(TokenInfo {
            token: access_token.token.clone(),
            expires_at,
        });

        Ok(access_token.token)
    }
}
