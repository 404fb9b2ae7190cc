use anyhow::Result;

pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command not found: {0}")]
    NotFound(String),
}

/// Runs external programs; mocked in tests
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

pub struct DefaultCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for DefaultCommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = match tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CommandError::NotFound(program.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// True when `error` means the program is not installed
pub fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<CommandError>(),
        Some(CommandError::NotFound(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_reported_as_not_found() {
        let err = DefaultCommandExecutor
            .execute("vertex-claude-no-such-program", &[])
            .await
            .err()
            .unwrap();
        assert!(is_not_found(&err));
    }
}
