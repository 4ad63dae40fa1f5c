use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_common::{Artifact, ConversionEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events buffered between the orchestrator and the transport.
pub const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct Disconnected;

/// Names already announced with `artifact_ready` in one session.
#[derive(Debug, Default)]
pub struct SentSet {
    names: HashSet<String>,
}

impl SentSet {
    /// Returns `true` the first time a name is seen.
    pub fn insert(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Writer of a session's progress events.
///
/// Owns the session's [`SentSet`]. Terminal events are not written here:
/// the supervising task sends exactly one through a [`TerminalHandle`],
/// outside the session's time budget, so a slow reader can delay the
/// terminal event but never lose it.
pub struct EventEmitter {
    session_id: Uuid,
    tx: mpsc::Sender<ConversionEvent>,
    sent: SentSet,
    terminal: TerminalHandle,
}

impl EventEmitter {
    pub fn new(session_id: Uuid, tx: mpsc::Sender<ConversionEvent>) -> Self {
        Self {
            session_id,
            terminal: TerminalHandle {
                tx: tx.clone(),
                claimed: Arc::new(AtomicBool::new(false)),
                delivered: Arc::new(AtomicBool::new(false)),
            },
            tx,
            sent: SentSet::default(),
        }
    }

    pub fn terminal_handle(&self) -> TerminalHandle {
        self.terminal.clone()
    }

    /// Whether the reading side has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }

    /// Write one progress event. Terminal events and anything after the
    /// terminal event has been claimed are dropped.
    pub async fn emit(&self, event: ConversionEvent) -> Result<(), Disconnected> {
        if event.is_terminal() {
            tracing::warn!(event = event.name(), "terminal events go through the terminal handle");
            return Ok(());
        }
        if self.terminal.claimed.load(Ordering::Acquire) {
            tracing::warn!(event = event.name(), "dropping event after terminal");
            return Ok(());
        }
        tracing::debug!(session_id = %self.session_id, event = event.name(), "emit");
        self.tx.send(event).await.map_err(|_| Disconnected)
    }

    /// Announce an artifact the first time it is valid. Returns whether an
    /// event was written.
    pub async fn artifact_ready(&mut self, artifact: &Artifact) -> Result<bool, Disconnected> {
        if !artifact.validated {
            return Ok(false);
        }
        if !self.sent.insert(&artifact.name) {
            tracing::debug!(artifact = %artifact.name, "already announced");
            return Ok(false);
        }
        self.emit(ConversionEvent::ArtifactReady {
            artifact: artifact.clone(),
        })
        .await?;
        Ok(true)
    }

    pub fn sent(&self) -> &SentSet {
        &self.sent
    }
}

/// Sends the one terminal event of a session.
///
/// The first caller claims the stream; later calls send nothing. The event
/// counts as delivered only once the channel has accepted it.
#[derive(Clone)]
pub struct TerminalHandle {
    tx: mpsc::Sender<ConversionEvent>,
    claimed: Arc<AtomicBool>,
    delivered: Arc<AtomicBool>,
}

impl TerminalHandle {
    /// Send `event` unless a terminal event was already claimed. Waits for
    /// buffer space. Returns whether it was delivered.
    pub async fn close_with(&self, event: ConversionEvent) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let delivered = self.tx.send(event).await.is_ok();
        self.delivered.store(delivered, Ordering::Release);
        delivered
    }

    pub fn is_terminated(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Whether a terminal event reached the channel.
    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}
