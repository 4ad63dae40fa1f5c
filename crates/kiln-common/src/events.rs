//! Event vocabulary of a conversion stream.
//!
//! Every event is serialized as one JSON object per line, adjacently tagged
//! as `{"type": "...", "data": {...}}`. A stream ends with exactly one
//! terminal event (`done` or `error`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Artifact, ArtifactStatus, ConversionResult, PendingSpec, TransactionSpec, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConversionEvent {
    Phase1Start {
        session_id: Uuid,
    },
    Phase1Complete {
        analysis: serde_json::Value,
        #[serde(default)]
        usage: Usage,
    },
    Phase2Start,
    Phase2Complete {
        contracts: Vec<PendingSpec>,
        #[serde(default)]
        transactions: Vec<TransactionSpec>,
        #[serde(default)]
        usage: Usage,
    },
    Phase3Start {
        attempt: u32,
    },
    Phase4Start {
        attempt: u32,
        retrying: Vec<String>,
    },
    Validation(ValidationReport),
    ArtifactReady {
        artifact: Artifact,
    },
    Done {
        result: ConversionResult,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ConversionEvent {
    pub fn error(message: impl Into<String>, phase: Option<u8>, detail: Option<&str>) -> Self {
        Self::Error {
            message: message.into(),
            phase,
            detail: detail.map(str::to_string),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Wire name of the event, as it appears in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Phase1Start { .. } => "phase1_start",
            Self::Phase1Complete { .. } => "phase1_complete",
            Self::Phase2Start => "phase2_start",
            Self::Phase2Complete { .. } => "phase2_complete",
            Self::Phase3Start { .. } => "phase3_start",
            Self::Phase4Start { .. } => "phase4_start",
            Self::Validation(_) => "validation",
            Self::ArtifactReady { .. } => "artifact_ready",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a single newline-terminated frame.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

/// Outcome of one attempt's validation round, over the full merged set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub attempt: u32,
    pub passed: bool,
    pub artifacts: Vec<ArtifactStatus>,
    pub valid_count: usize,
    pub failed_count: usize,
    /// Set when the attempt's completion call failed before anything could be validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationReport {
    pub fn from_artifacts(attempt: u32, artifacts: &[Artifact], error: Option<String>) -> Self {
        let statuses: Vec<ArtifactStatus> = artifacts.iter().map(Artifact::status).collect();
        let valid_count = statuses.iter().filter(|s| s.validated).count();
        let failed_count = statuses.len() - valid_count;
        Self {
            attempt,
            passed: error.is_none() && !statuses.is_empty() && failed_count == 0,
            artifacts: statuses,
            valid_count,
            failed_count,
            error,
        }
    }
}
