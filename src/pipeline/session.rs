//! Session-scoped state and the shapes of oracle output.

use std::collections::HashSet;

use kiln_common::{Artifact, ArtifactMode, PendingSpec, SessionStatus, TransactionSpec, Usage};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::OracleError;

/// Fallback artifact name for single-artifact output when the plan does not
/// name exactly one contract.
pub const SINGLE_ARTIFACT_NAME: &str = "main";

/// Everything one conversion session owns. Never shared between sessions.
#[derive(Debug)]
pub struct SessionState {
    pub id: Uuid,
    pub status: SessionStatus,
    pub attempt: u32,
    /// Fixed by the first generation response that parses.
    pub mode: Option<ArtifactMode>,
    /// Authoritative artifact order, fixed together with `mode`.
    pub order: Vec<String>,
    /// Current merged set, in `order`.
    pub artifacts: Vec<Artifact>,
    pub analysis: Value,
    pub plan: Plan,
    pub deployment: Option<Value>,
    pub usage: Usage,
}

impl SessionState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: SessionStatus::Idle,
            attempt: 0,
            mode: None,
            order: Vec::new(),
            artifacts: Vec::new(),
            analysis: Value::Null,
            plan: Plan::default(),
            deployment: None,
            usage: Usage::default(),
        }
    }

    /// Artifacts that passed validation, cloned.
    pub fn accepted(&self) -> Vec<Artifact> {
        self.artifacts.iter().filter(|a| a.validated).cloned().collect()
    }

    /// Artifacts carried into the next repair attempt.
    pub fn retry_batch(&self) -> Vec<&Artifact> {
        self.artifacts.iter().filter(|a| !a.validated).collect()
    }

    pub fn all_valid(&self) -> bool {
        !self.artifacts.is_empty() && self.artifacts.iter().all(|a| a.validated)
    }

    /// `name: error` of the first invalid artifact in order.
    pub fn first_error(&self) -> Option<String> {
        self.artifacts.iter().find(|a| !a.validated).map(|a| {
            format!(
                "{}: {}",
                a.name,
                a.validation_error.as_deref().unwrap_or("validation failed")
            )
        })
    }

    pub fn single_artifact_name(&self) -> String {
        match self.plan.contracts.as_slice() {
            [only] => only.name.clone(),
            _ => SINGLE_ARTIFACT_NAME.to_string(),
        }
    }
}

/// Phase 2 output: contracts to generate and transactions to support.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub contracts: Vec<PendingSpec>,
    #[serde(default)]
    pub transactions: Vec<TransactionSpec>,
}

impl Plan {
    pub fn parse(data: Value) -> Result<Self, OracleError> {
        serde_json::from_value(data)
            .map_err(|e| OracleError::Malformed(format!("plan does not match schema: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratedContract {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Generation or repair output.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Single {
        code: String,
    },
    Multi {
        contracts: Vec<GeneratedContract>,
        deployment: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    contracts: Option<Vec<GeneratedContract>>,
    #[serde(default)]
    deployment: Option<Value>,
}

fn raw(data: Value) -> Result<RawOutput, OracleError> {
    serde_json::from_value(data)
        .map_err(|e| OracleError::Malformed(format!("generation output does not match schema: {}", e)))
}

impl GenerationOutput {
    /// Classify a first generation response. A non-empty `contracts` array
    /// is multi-artifact; otherwise a `code` string is single-artifact.
    pub fn classify(data: Value) -> Result<Self, OracleError> {
        let raw = raw(data)?;
        match (raw.contracts, raw.code) {
            (Some(contracts), _) if !contracts.is_empty() => {
                let mut seen = HashSet::new();
                for contract in &contracts {
                    if contract.name.trim().is_empty() {
                        return Err(OracleError::Malformed("contract with empty name".into()));
                    }
                    if !seen.insert(contract.name.as_str()) {
                        return Err(OracleError::Malformed(format!(
                            "duplicate contract name '{}'",
                            contract.name
                        )));
                    }
                }
                Ok(Self::Multi {
                    contracts,
                    deployment: raw.deployment,
                })
            }
            (_, Some(code)) => Ok(Self::Single { code }),
            _ => Err(OracleError::Malformed(
                "generation output has neither contracts nor code".into(),
            )),
        }
    }

    /// Parse a repair response under the session's fixed mode.
    pub fn parse_as(mode: ArtifactMode, data: Value) -> Result<Self, OracleError> {
        let raw = raw(data)?;
        match mode {
            ArtifactMode::Multi => Ok(Self::Multi {
                contracts: raw.contracts.ok_or_else(|| {
                    OracleError::Malformed("repair output is missing contracts".into())
                })?,
                deployment: raw.deployment,
            }),
            ArtifactMode::Single => {
                let code = raw
                    .code
                    .or_else(|| {
                        raw.contracts
                            .and_then(|mut c| (c.len() == 1).then(|| c.remove(0).code))
                    })
                    .ok_or_else(|| OracleError::Malformed("repair output is missing code".into()))?;
                Ok(Self::Single { code })
            }
        }
    }

    pub fn mode(&self) -> ArtifactMode {
        match self {
            Self::Single { .. } => ArtifactMode::Single,
            Self::Multi { .. } => ArtifactMode::Multi,
        }
    }

    /// Split into artifacts stamped with `attempt`, in response order.
    pub fn into_artifacts(self, attempt: u32, single_name: &str) -> (Vec<Artifact>, Option<Value>) {
        match self {
            Self::Single { code } => (vec![Artifact::new(single_name, code, attempt)], None),
            Self::Multi {
                contracts,
                deployment,
            } => {
                let artifacts = contracts
                    .into_iter()
                    .enumerate()
                    .map(|(order, c)| {
                        let mut artifact = Artifact::new(c.name, c.code, attempt);
                        artifact.role = c.role;
                        artifact.order = order;
                        artifact
                    })
                    .collect();
                (artifacts, deployment)
            }
        }
    }
}
