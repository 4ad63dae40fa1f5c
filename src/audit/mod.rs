//! Offline audit trail of conversion sessions.
//!
//! The orchestrator hands records to an [`AuditSink`] at fixed points:
//! session start, each oracle call completion, each persisted artifact, and
//! session end. Sinks must not block the caller; the event stream never
//! waits on persistence.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kiln_common::{SessionStatus, Usage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod logger;
pub use logger::JsonlAuditLogger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditRecord {
    pub fn new(session_id: Uuid, kind: AuditKind) -> Self {
        Self {
            session_id,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditKind {
    SessionStarted {
        source_chars: usize,
    },
    OracleCall {
        phase: u8,
        attempt: Option<u32>,
        duration_ms: u64,
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ArtifactPersisted {
        name: String,
        attempt: u32,
        size: Option<u64>,
        code_chars: usize,
    },
    SessionFinished {
        status: SessionStatus,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Destination for audit records. Implementations return immediately.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Sink used when auditing is disabled.
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _record: AuditRecord) {}
}

/// In-memory sink, handy for inspecting what a session recorded.
#[derive(Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
