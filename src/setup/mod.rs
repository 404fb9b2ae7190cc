//! Preflight checker for using Claude through Vertex AI.
//!
//! Runs, in order: gcloud installation, Application Default Credentials,
//! active project, region, and Vertex AI API enablement. The first three are
//! hard requirements; the API check only warns.

mod report;

pub use report::{Reporter, Status};

use crate::config::{is_valid_region, Env, ProcessEnv, DEFAULT_REGION, REGION_ENV_VARS};
use crate::llm::credentials::{adc_path, check_credential_expiry, AdcCredentials, CredentialKind};
use crate::utils::command::{is_not_found, CommandExecutor};
use crate::utils::input::{is_yes, Prompter};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const PROJECT_VAR: &str = "GOOGLE_CLOUD_PROJECT";
const REGION_VAR: &str = "GOOGLE_CLOUD_REGION";

const COMMON_REGIONS: &[(&str, &str)] = &[
    ("us-central1", "Iowa"),
    ("us-east4", "Virginia"),
    ("us-east5", "Ohio"),
    ("europe-west1", "Belgium"),
    ("europe-west4", "Netherlands"),
    ("asia-southeast1", "Singapore"),
];

/// Environment that can also be written, for the current session only
pub trait EnvStore: Env {
    fn set(&mut self, key: &str, value: &str);

    fn as_env(&self) -> &dyn Env;
}

impl EnvStore for ProcessEnv {
    fn set(&mut self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn as_env(&self) -> &dyn Env {
        self
    }
}

impl EnvStore for HashMap<String, String> {
    fn set(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }

    fn as_env(&self) -> &dyn Env {
        self
    }
}

/// Commands that make `var=value` permanent for the user's shell
fn persist_instructions(shell: &str, var: &str, value: &str) -> String {
    if shell.contains("fish") {
        return format!("  echo 'set -gx {var} {value}' >> ~/.config/fish/config.fish");
    }
    let config_file = if shell.contains("bash") {
        "~/.bashrc"
    } else if shell.contains("zsh") {
        "~/.zshrc"
    } else {
        "your shell configuration file"
    };
    format!("  echo 'export {var}={value}' >> {config_file}")
}

/// gcloud prints `(unset)` for missing config values
fn config_value(stdout: &str) -> Option<String> {
    let value = stdout.trim();
    (!value.is_empty() && value != "(unset)").then(|| value.to_string())
}

pub struct SetupChecker {
    executor: Arc<dyn CommandExecutor>,
    prompter: Box<dyn Prompter>,
    env: Box<dyn EnvStore>,
    reporter: Reporter,
}

impl SetupChecker {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        prompter: Box<dyn Prompter>,
        env: Box<dyn EnvStore>,
        reporter: Reporter,
    ) -> Self {
        Self {
            executor,
            prompter,
            env,
            reporter,
        }
    }

    pub fn env(&self) -> &dyn EnvStore {
        self.env.as_ref()
    }

    /// Run every check; returns the process exit code
    pub async fn run(&mut self) -> Result<i32> {
        self.reporter.blank()?;
        self.reporter
            .heading("Google Cloud Vertex AI Setup Validator")?;
        self.reporter.blank()?;

        if !self.check_gcloud().await? {
            self.reporter
                .error("Setup incomplete: gcloud SDK not found")?;
            return Ok(1);
        }
        self.reporter.blank()?;

        let Some(kind) = self.check_adc()? else {
            self.reporter
                .error("Setup incomplete: Application Default Credentials not valid")?;
            return Ok(1);
        };
        self.reporter.blank()?;

        let Some(project) = self.current_project().await? else {
            self.reporter.error("No active gcloud project found")?;
            self.reporter
                .info("Set a project with: gcloud config set project PROJECT_ID")?;
            self.reporter
                .error("Setup incomplete: No project configured")?;
            return Ok(1);
        };
        self.reporter
            .success(&format!("Active gcloud project: {project}"))?;
        self.set_project(&project)?;
        self.reporter.blank()?;

        let region = self.region().await?;
        self.reporter.blank()?;

        let api_enabled = self.check_vertex_api(&project).await?;

        let rule = "=".repeat(60);
        self.reporter.blank()?;
        self.reporter.heading(&rule)?;
        self.reporter.heading("Setup Summary")?;
        self.reporter.heading(&rule)?;
        self.reporter.success(&format!("Project: {project}"))?;
        self.reporter.success(&format!("Region: {region}"))?;
        self.reporter.success(&format!("Credentials: {kind}"))?;
        if api_enabled {
            self.reporter.success("Vertex AI API: enabled")?;
            self.reporter.blank()?;
            self.reporter.success("All checks passed!")?;
            self.reporter
                .info("You can now run: vertex-claude prompt -m vertex-4.5-sonnet 'Hello!'")?;
        } else {
            self.reporter.warning("Vertex AI API: not verified/enabled")?;
            self.reporter.blank()?;
            self.reporter
                .warning("Setup mostly complete, but please enable the Vertex AI API")?;
        }
        Ok(0)
    }

    async fn check_gcloud(&mut self) -> Result<bool> {
        match self.executor.execute("gcloud", &["--version"]).await {
            Ok(output) if output.success => {
                let version = output.stdout.lines().next().unwrap_or_default();
                self.reporter
                    .success(&format!("gcloud SDK is installed: {version}"))?;
                Ok(true)
            }
            Ok(_) => {
                self.reporter.error("gcloud SDK is not working properly")?;
                Ok(false)
            }
            Err(e) if is_not_found(&e) => {
                self.reporter.error("gcloud SDK is not installed")?;
                self.reporter
                    .info("Install it from: https://cloud.google.com/sdk/docs/install")?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn check_adc(&mut self) -> Result<Option<CredentialKind>> {
        let Some(path) = adc_path(self.env.as_env()) else {
            self.reporter
                .error("Application Default Credentials not found")?;
            self.reporter.info("Run one of the following commands:")?;
            self.reporter
                .info("  For user credentials: gcloud auth application-default login")?;
            self.reporter.info(
                "  For service account: export GOOGLE_APPLICATION_CREDENTIALS=/path/to/key.json",
            )?;
            return Ok(None);
        };
        self.reporter.success(&format!(
            "Found Application Default Credentials at: {}",
            path.display()
        ))?;

        let creds = match AdcCredentials::load(&path) {
            Ok(creds) => creds,
            Err(e) => {
                self.reporter
                    .error(&format!("Error reading credentials: {e:#}"))?;
                return Ok(None);
            }
        };

        let (valid, kind) = check_credential_expiry(&creds, Utc::now());
        if !valid {
            self.reporter.error("Credentials have expired")?;
            self.reporter
                .info("Run: gcloud auth application-default login")?;
            return Ok(None);
        }

        match kind {
            CredentialKind::User => self.reporter.success("User account credentials are valid")?,
            CredentialKind::ServiceAccount => self
                .reporter
                .success("Service account credentials are configured")?,
            CredentialKind::Other => self.reporter.success("Credentials appear to be valid")?,
        }
        Ok(Some(kind))
    }

    async fn gcloud_config(&self, key: &str) -> Result<Option<String>> {
        match self
            .executor
            .execute("gcloud", &["config", "get-value", key])
            .await
        {
            Ok(output) if output.success => Ok(config_value(&output.stdout)),
            Ok(output) => {
                debug!("gcloud config get-value {key} failed: {}", output.stderr);
                Ok(None)
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn current_project(&self) -> Result<Option<String>> {
        self.gcloud_config("project").await
    }

    fn persist_hint(&mut self, var: &str, value: &str) -> Result<()> {
        let shell = self.env.var("SHELL").unwrap_or_default();
        self.reporter
            .info("To make this permanent, add to your shell configuration:")?;
        self.reporter
            .info(&persist_instructions(&shell, var, value))?;
        Ok(())
    }

    fn set_project(&mut self, project: &str) -> Result<()> {
        if let Some(existing) = self.env.var(PROJECT_VAR) {
            if existing == project {
                self.reporter
                    .success(&format!("{PROJECT_VAR} already set to: {project}"))?;
                return Ok(());
            }
            self.reporter.warning(&format!(
                "{PROJECT_VAR} is set to '{existing}' but active project is '{project}'"
            ))?;
            let answer = self
                .prompter
                .ask(&format!("Update to '{project}'? [Y/n]: "))?;
            if !is_yes(answer.as_deref()) {
                self.reporter
                    .info(&format!("Keeping existing {PROJECT_VAR} value"))?;
                return Ok(());
            }
        }

        self.env.set(PROJECT_VAR, project);
        self.reporter
            .success(&format!("Set {PROJECT_VAR}={project} for this session"))?;
        self.persist_hint(PROJECT_VAR, project)
    }

    async fn region(&mut self) -> Result<String> {
        if let Some(region) = self.env.first_of(REGION_ENV_VARS) {
            self.reporter
                .success(&format!("Using region from environment: {region}"))?;
            return Ok(region);
        }

        if let Some(region) = self.gcloud_config("compute/region").await? {
            self.reporter
                .success(&format!("Using region from gcloud config: {region}"))?;
            let answer = self.prompter.ask("Use this region? [Y/n]: ")?;
            if is_yes(answer.as_deref()) {
                return Ok(region);
            }
        }

        self.reporter.info("Common Vertex AI regions:")?;
        for (region, location) in COMMON_REGIONS {
            self.reporter
                .info(&format!("  {region:<16}({location})"))?;
        }
        self.reporter.info(
            "For the full list, see: https://cloud.google.com/vertex-ai/docs/general/locations",
        )?;

        let region = loop {
            let answer = self
                .prompter
                .ask(&format!("Enter your region (default: {DEFAULT_REGION}): "))?;
            let region = match answer.as_deref().map(str::trim) {
                None | Some("") => DEFAULT_REGION.to_string(),
                Some(region) => region.to_string(),
            };
            if is_valid_region(&region) {
                break region;
            }
            self.reporter.warning(
                "Region format looks incorrect. Please use format like 'us-central1'",
            )?;
        };

        self.env.set(REGION_VAR, &region);
        self.reporter
            .success(&format!("Set {REGION_VAR}={region} for this session"))?;
        self.persist_hint(REGION_VAR, &region)?;
        Ok(region)
    }

    async fn check_vertex_api(&mut self, project: &str) -> Result<bool> {
        let project_arg = format!("--project={project}");
        let output = match self
            .executor
            .execute(
                "gcloud",
                &[
                    "services",
                    "list",
                    "--enabled",
                    "--filter=name:aiplatform.googleapis.com",
                    "--format=value(name)",
                    &project_arg,
                ],
            )
            .await
        {
            Ok(output) => output,
            Err(e) if is_not_found(&e) => {
                self.reporter
                    .warning("Could not check Vertex AI API status (gcloud not available)")?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !output.success {
            self.reporter
                .warning("Could not verify if Vertex AI API is enabled")?;
            self.reporter
                .info(&format!("Error: {}", output.stderr.trim()))?;
            self.reporter.info(
                "You may not have permission to list services, or the API might not be enabled",
            )?;
            return Ok(false);
        }

        if output.stdout.contains("aiplatform.googleapis.com") {
            self.reporter.success("Vertex AI API is enabled")?;
            return Ok(true);
        }

        self.reporter.warning("Vertex AI API is not enabled")?;
        self.reporter.info("Enable it with:")?;
        self.reporter.info(&format!(
            "  gcloud services enable aiplatform.googleapis.com --project={project}"
        ))?;
        self.reporter.info(
            "Or visit: https://console.cloud.google.com/apis/library/aiplatform.googleapis.com",
        )?;
        Ok(false)
    }
}
