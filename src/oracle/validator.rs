use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ValidationOracle, ValidationOutcome};
use crate::config::ValidatorSection;
use crate::errors::OracleError;

/// Validates code by running an external compiler on a scratch file.
///
/// Invocation is `<command> <args...> <file>`. Exit status 0 means valid;
/// stdout, when present, becomes the artifact metadata. Any other exit is
/// an invalid artifact whose error is the compiler's diagnostics.
pub struct CommandValidator {
    command: String,
    args: Vec<String>,
    extension: String,
    scratch_dir: PathBuf,
}

impl CommandValidator {
    pub fn new(command: impl Into<String>, args: Vec<String>, extension: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            extension: extension.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn from_config(section: &ValidatorSection) -> Self {
        Self::new(
            section.command.clone(),
            section.args.clone(),
            section.extension.clone(),
        )
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

fn parse_metadata(stdout: &str) -> Option<serde_json::Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string())),
    )
}

#[async_trait]
impl ValidationOracle for CommandValidator {
    async fn validate(&self, code: &str) -> Result<ValidationOutcome, OracleError> {
        // Removed on drop, including when this future is cancelled mid-run.
        let scratch = tempfile::Builder::new()
            .prefix("kiln-")
            .suffix(&format!(".{}", self.extension))
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| OracleError::Unavailable(format!("failed to create scratch file: {}", e)))?;
        tokio::fs::write(scratch.path(), code)
            .await
            .map_err(|e| OracleError::Unavailable(format!("failed to write scratch file: {}", e)))?;

        let result = Command::new(&self.command)
            .args(&self.args)
            .arg(scratch.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        if let Err(e) = scratch.close() {
            tracing::debug!(error = %e, "failed to remove scratch file");
        }

        let output = result.map_err(|source| OracleError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return Ok(ValidationOutcome::Valid {
                size: code.len() as u64,
                metadata: parse_metadata(&stdout),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let error = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        let error = if error.is_empty() {
            format!(
                "{} exited with code {}",
                self.command,
                output.status.code().unwrap_or(-1)
            )
        } else {
            error
        };
        Ok(ValidationOutcome::Invalid { error })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str, dir: &TempDir) -> CommandValidator {
        CommandValidator::new("sh", vec!["-c".into(), script.into()], "compact")
            .with_scratch_dir(dir.path())
    }

    #[tokio::test]
    async fn test_zero_exit_is_valid_with_json_metadata() {
        let dir = TempDir::new().unwrap();
        let validator = sh("echo '{\"circuits\": 2}'", &dir);
        let outcome = validator.validate("circuit a() {}").await.unwrap();
        match outcome {
            ValidationOutcome::Valid { size, metadata } => {
                assert_eq!(size, 14);
                assert_eq!(metadata.unwrap()["circuits"], 2);
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let validator = sh("echo 'line 3: unknown type' >&2; exit 1", &dir);
        let outcome = validator.validate("bad").await.unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Invalid {
                error: "line 3: unknown type".into()
            }
        );
    }

    #[tokio::test]
    async fn test_validator_sees_code_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        // $0 is the scratch file path appended after the script.
        let validator = sh("grep -q ledger \"$0\"", &dir);
        assert!(validator.validate("export ledger x;").await.unwrap().is_valid());
        assert!(!validator.validate("nothing here").await.unwrap().is_valid());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_validation_removes_scratch_file() {
        let dir = TempDir::new().unwrap();
        let validator = sh("sleep 5", &dir);
        let run = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            validator.validate("export ledger x;"),
        )
        .await;
        assert!(run.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let validator = CommandValidator::new("kiln-test-no-such-compiler", vec![], "compact")
            .with_scratch_dir(dir.path());
        assert!(matches!(
            validator.validate("x").await,
            Err(OracleError::Spawn { .. })
        ));
    }
}
