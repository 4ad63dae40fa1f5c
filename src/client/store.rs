use kiln_common::{
    Artifact, ConversionEvent, ConversionResult, PendingSpec, SessionStatus, TransactionSpec, Usage,
    ValidationReport,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Terminal error as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreError {
    pub message: String,
    pub phase: Option<u8>,
    pub detail: Option<String>,
}

/// Client-side view of one conversion, rebuilt purely from its events.
///
/// `epoch` identifies the session the store currently belongs to; the
/// driver only applies events tagged with the current epoch, so a stream
/// from a replaced session can never write into the new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStore {
    pub epoch: u64,
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub attempt: u32,
    pub analysis: Option<Value>,
    pub pending_specs: Vec<PendingSpec>,
    pub transactions: Vec<TransactionSpec>,
    /// Announced artifacts, in first-announcement order.
    pub contracts: Vec<Artifact>,
    pub last_validation: Option<ValidationReport>,
    pub result: Option<ConversionResult>,
    pub error: Option<StoreError>,
    pub usage: Usage,
}

impl ClientStore {
    /// Fresh, idle store for a new session.
    pub fn for_epoch(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    /// Fold one event into the store. Returns whether anything changed.
    ///
    /// Events after a terminal event are ignored.
    pub fn apply(&mut self, event: &ConversionEvent) -> bool {
        if self.status.is_terminal() {
            tracing::debug!(event = event.name(), status = %self.status, "ignoring event after terminal");
            return false;
        }

        match event {
            ConversionEvent::Phase1Start { session_id } => {
                self.session_id = Some(*session_id);
                self.status = SessionStatus::Phase1;
            }
            ConversionEvent::Phase1Complete { analysis, usage } => {
                self.analysis = Some(analysis.clone());
                self.usage += *usage;
            }
            ConversionEvent::Phase2Start => {
                self.status = SessionStatus::Phase2;
            }
            ConversionEvent::Phase2Complete {
                contracts,
                transactions,
                usage,
            } => {
                self.pending_specs = contracts.clone();
                self.transactions = transactions.clone();
                self.usage += *usage;
            }
            ConversionEvent::Phase3Start { attempt } => {
                self.status = SessionStatus::Phase3;
                self.attempt = *attempt;
            }
            ConversionEvent::Phase4Start { attempt, .. } => {
                self.status = SessionStatus::Phase4;
                self.attempt = *attempt;
            }
            ConversionEvent::Validation(report) => {
                self.last_validation = Some(report.clone());
            }
            ConversionEvent::ArtifactReady { artifact } => {
                self.upsert(artifact.clone());
            }
            ConversionEvent::Done { result } => {
                for artifact in &result.artifacts {
                    self.upsert(artifact.clone());
                }
                self.usage = result.usage;
                self.result = Some(result.clone());
                self.status = SessionStatus::Complete;
            }
            ConversionEvent::Error {
                message,
                phase,
                detail,
            } => {
                self.error = Some(StoreError {
                    message: message.clone(),
                    phase: *phase,
                    detail: detail.clone(),
                });
                self.status = SessionStatus::Error;
            }
        }
        true
    }

    /// Insert by name, replacing an existing entry in place.
    fn upsert(&mut self, artifact: Artifact) {
        match self.contracts.iter_mut().find(|c| c.name == artifact.name) {
            Some(existing) => *existing = artifact,
            None => self.contracts.push(artifact),
        }
    }

    /// Planned contracts that have not been announced yet.
    ///
    /// Empty once the session completes: a single-mode result may carry one
    /// merged artifact whose name matches none of the planned contracts.
    pub fn pending_contracts(&self) -> Vec<&PendingSpec> {
        if self.status == SessionStatus::Complete {
            return Vec::new();
        }
        self.pending_specs
            .iter()
            .filter(|spec| !self.contracts.iter().any(|c| c.name == spec.name))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
