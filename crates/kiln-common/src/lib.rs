//! Shared types for kiln.
//!
//! Both the orchestrator (server side) and the client store depend on this
//! crate, so the event vocabulary that travels over the wire has exactly one
//! definition.

pub mod events;
pub mod models;

pub use events::{ConversionEvent, ValidationReport};
pub use models::{
    Artifact, ArtifactMode, ArtifactStatus, ConversionResult, PendingSpec, SessionStatus,
    TransactionSpec, Usage,
};
