//! The conversion pipeline: phases, repair loop, merge, and event stream.

pub mod admission;
pub mod emitter;
pub mod merge;
pub mod prompts;
pub mod runner;
pub mod session;

pub use admission::{AdmissionControl, AdmissionPermit};
pub use emitter::{EventEmitter, SentSet};
pub use merge::merge;
pub use runner::{PhaseOrchestrator, PipelineSettings, SessionHandle, SessionOutcome};
pub use session::{GenerationOutput, SessionState};
