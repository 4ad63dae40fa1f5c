use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token usage reported by the completion oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Placeholder for a contract that has been planned but not generated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub responsibilities: String,
}

/// A transaction (entry point) the converted system must support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Names of the contracts that take part in this transaction.
    #[serde(default)]
    pub contracts: Vec<String>,
}

/// One generated contract.
///
/// `name` is the identity key. Once an artifact is validated and announced
/// to a client its `code` and `validated` fields are frozen for the rest of
/// the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Deployment position within the session's artifact set (0-based).
    #[serde(default)]
    pub order: usize,
    /// Compiled size in bytes, reported by the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Attempt that produced the currently held code.
    #[serde(default)]
    pub attempt: u32,
}

impl Artifact {
    pub fn new(name: impl Into<String>, code: impl Into<String>, attempt: u32) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            validated: false,
            validation_error: None,
            role: None,
            order: 0,
            size: None,
            metadata: None,
            attempt,
        }
    }

    pub fn status(&self) -> ArtifactStatus {
        ArtifactStatus {
            name: self.name.clone(),
            validated: self.validated,
            attempt: self.attempt,
        }
    }
}

/// Per-artifact line of a validation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub name: String,
    pub validated: bool,
    pub attempt: u32,
}

/// Shape of the generation output, fixed once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMode {
    Single,
    Multi,
}

impl ArtifactMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Phase3 => "phase3",
            Self::Phase4 => "phase4",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Phase number for the running phases, `None` otherwise.
    pub fn phase(&self) -> Option<u8> {
        match self {
            Self::Phase1 => Some(1),
            Self::Phase2 => Some(2),
            Self::Phase3 => Some(3),
            Self::Phase4 => Some(4),
            _ => None,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "phase1" => Ok(Self::Phase1),
            "phase2" => Ok(Self::Phase2),
            "phase3" => Ok(Self::Phase3),
            "phase4" => Ok(Self::Phase4),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final payload of a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub session_id: Uuid,
    pub mode: ArtifactMode,
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub transactions: Vec<TransactionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<serde_json::Value>,
    pub attempts: u32,
    #[serde(default)]
    pub usage: Usage,
    pub finished_at: DateTime<Utc>,
}
