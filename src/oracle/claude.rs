use std::process::Stdio;

use async_trait::async_trait;
use kiln_common::Usage;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Completion, CompletionOracle, CompletionRequest, extract_json_object};
use crate::config::OracleSection;
use crate::errors::OracleError;

/// Completion oracle backed by the `claude` CLI in print mode.
///
/// The user message goes over stdin so large sources never hit argv limits.
/// The CLI's JSON envelope carries the answer text and token usage.
pub struct ClaudeCliOracle {
    command: String,
    model: Option<String>,
}

impl ClaudeCliOracle {
    pub fn new(command: impl Into<String>, model: Option<String>) -> Self {
        Self {
            command: command.into(),
            model,
        }
    }

    pub fn from_config(section: &OracleSection) -> Self {
        Self::new(section.claude_cmd.clone(), section.model.clone())
    }

    fn args(&self, request: &CompletionRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--system-prompt".to_string());
        args.push(system_prompt_with_schema(request));
        args
    }
}

fn system_prompt_with_schema(request: &CompletionRequest) -> String {
    let schema = serde_json::to_string_pretty(&request.schema).unwrap_or_default();
    format!(
        "{}\n\nRespond with exactly one JSON object and nothing else. It must match this JSON schema:\n{}",
        request.system_prompt, schema
    )
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Usage,
}

/// Decode the CLI's `--output-format json` envelope.
pub fn parse_envelope(stdout: &str) -> Result<Completion, OracleError> {
    let envelope: Envelope = serde_json::from_str(stdout.trim())
        .map_err(|e| OracleError::Malformed(format!("unreadable CLI envelope: {}", e)))?;
    let text = envelope
        .result
        .ok_or_else(|| OracleError::Malformed("CLI envelope has no result".into()))?;
    if envelope.is_error {
        return Err(OracleError::Unavailable(text));
    }
    Ok(Completion {
        data: extract_json_object(&text)?,
        usage: envelope.usage,
    })
}

#[async_trait]
impl CompletionOracle for ClaudeCliOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, OracleError> {
        tracing::debug!(stage = request.stage.as_str(), command = %self.command, "calling completion oracle");

        let mut child = Command::new(&self.command)
            .args(self.args(&request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OracleError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.user_message.as_bytes())
                .await
                .map_err(|e| OracleError::Unavailable(format!("failed to write prompt: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OracleError::Unavailable(format!("failed to read CLI output: {}", e)))?;

        if !output.status.success() {
            return Err(OracleError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_envelope(&String::from_utf8_lossy(&output.stdout))
    }
}
