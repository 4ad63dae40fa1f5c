//! External black-box calls the pipeline depends on.
//!
//! Two seams: a [`CompletionOracle`] that turns a prompt plus an output
//! schema into structured JSON, and a [`ValidationOracle`] that compiles one
//! artifact's code. Production implementations shell out to the `claude` CLI
//! and the configured compiler; [`scripted`] holds deterministic doubles.

use std::sync::LazyLock;

use async_trait::async_trait;
use kiln_common::Usage;
use regex::Regex;
use serde_json::Value;

use crate::errors::OracleError;

pub mod claude;
pub mod scripted;
pub mod validator;

pub use claude::ClaudeCliOracle;
pub use validator::CommandValidator;

static FENCED_JSON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Which pipeline step a completion request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analysis,
    Plan,
    Generate,
    Repair,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Plan => "plan",
            Self::Generate => "generate",
            Self::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub stage: Stage,
    pub system_prompt: String,
    /// JSON schema the response object must satisfy.
    pub schema: Value,
    pub user_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub data: Value,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid {
        size: u64,
        metadata: Option<Value>,
    },
    Invalid {
        error: String,
    },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[async_trait]
pub trait CompletionOracle: Send + Sync {
    /// One structured completion. Malformed or truncated output is an error;
    /// the call is never retried internally.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, OracleError>;
}

#[async_trait]
pub trait ValidationOracle: Send + Sync {
    /// Check one artifact. `Err` means the validator itself could not run,
    /// not that the code is invalid.
    async fn validate(&self, code: &str) -> Result<ValidationOutcome, OracleError>;
}

/// Pull the JSON object out of a free-text model answer.
///
/// Models often wrap the object in prose or a fenced block. A ```json fence
/// wins when present; otherwise everything from the first `{` to the last `}`
/// is taken.
pub fn extract_json_object(text: &str) -> Result<Value, OracleError> {
    let body = FENCED_JSON_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    let start = body
        .find('{')
        .ok_or_else(|| OracleError::Malformed("no JSON object in response".into()))?;
    let end = body
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| OracleError::Malformed("truncated JSON object in response".into()))?;
    let value: Value = serde_json::from_str(&body[start..=end])
        .map_err(|e| OracleError::Malformed(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(OracleError::Malformed("response is not a JSON object".into()));
    }
    Ok(value)
}
