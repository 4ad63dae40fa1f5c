//! Typed error hierarchy for kiln.
//!
//! - `InputError`: ingress rejection, raised before any oracle call
//! - `OracleError`: completion or validation oracle could not produce an answer
//! - `MergeError`: a repair batch could not be merged back into the session's artifact set
//! - `PipelineError`: everything that ends a session with a terminal `error` event

use thiserror::Error;

/// Reasons a conversion request is rejected at the door.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Source is empty")]
    Empty,

    #[error("Source is too short ({actual} chars, minimum {min})")]
    TooShort { min: usize, actual: usize },

    #[error("Source is too large ({actual} chars, maximum {max})")]
    TooLarge { max: usize, actual: usize },
}

/// Failures of an external oracle call.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Failed to spawn oracle process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Oracle process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Malformed oracle output: {0}")]
    Malformed(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

/// Integrity failures while merging a repair batch into the accepted set.
///
/// These indicate the orchestrator could not keep the artifact set whole,
/// not that a generated artifact was bad.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Artifact '{name}' is missing from both the accepted set and the fix batch")]
    MissingArtifact { name: String },

    #[error("Fix batch introduced unknown artifact '{name}' with no missing slot to reconcile it to")]
    UnexpectedArtifact { name: String },

    #[error("Cannot reconcile renamed artifacts {unknown:?} to missing slots {missing:?}")]
    AmbiguousRename {
        unknown: Vec<String>,
        missing: Vec<String>,
    },
}

/// Errors that end a session with a terminal `error` event.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Phase {phase} failed: {source}")]
    Oracle {
        phase: u8,
        #[source]
        source: OracleError,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Generation did not validate after {attempts} attempts: {first_error}")]
    AttemptsExhausted { attempts: u32, first_error: String },
}

impl PipelineError {
    /// Phase the error belongs to, when known.
    pub fn phase(&self) -> Option<u8> {
        match self {
            Self::Oracle { phase, .. } => Some(*phase),
            Self::Merge(_) | Self::AttemptsExhausted { .. } => None,
        }
    }

    /// Short machine-readable classification carried in the `detail` field.
    pub fn detail(&self) -> &'static str {
        match self {
            Self::Oracle { .. } => "oracle",
            Self::Merge(_) => "merge_integrity",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
        }
    }
}
