use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{AuditRecord, AuditSink};

/// Appends audit records to `<dir>/<session_id>.jsonl` from a background task.
///
/// `record` only enqueues; a write failure is logged and never surfaces to
/// the session that produced the record.
pub struct JsonlAuditLogger {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl JsonlAuditLogger {
    /// Start the writer task. It exits once every logger handle is dropped
    /// and the queue is drained.
    pub fn spawn(audit_dir: &Path) -> Result<(Self, JoinHandle<()>)> {
        std::fs::create_dir_all(audit_dir)
            .with_context(|| format!("Failed to create audit directory {}", audit_dir.display()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        let dir = audit_dir.to_path_buf();

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = append(&dir, &record).await {
                    tracing::warn!(
                        session_id = %record.session_id,
                        error = %format!("{:#}", e),
                        "failed to write audit record"
                    );
                }
            }
        });

        Ok((Self { tx }, handle))
    }
}

impl AuditSink for JsonlAuditLogger {
    fn record(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!("audit writer has stopped; record dropped");
        }
    }
}

fn session_file(dir: &Path, session_id: &Uuid) -> PathBuf {
    dir.join(format!("{}.jsonl", session_id))
}

async fn append(dir: &Path, record: &AuditRecord) -> Result<()> {
    let mut line = serde_json::to_string(record).context("Failed to serialize audit record")?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(session_file(dir, &record.session_id))
        .await
        .context("Failed to open audit file")?;
    file.write_all(line.as_bytes())
        .await
        .context("Failed to append audit record")?;
    Ok(())
}

/// Read back every record of one session, in the order written.
pub fn load_session(dir: &Path, session_id: &Uuid) -> Result<Vec<AuditRecord>> {
    let path = session_file(dir, session_id);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("No audit trail at {}", path.display()))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Malformed audit record on line {}", i + 1))
        })
        .collect()
}

/// Session ids with an audit trail in `dir`, most recently modified first.
pub fn list_sessions(dir: &Path) -> Result<Vec<Uuid>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(std::time::SystemTime, Uuid)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().map(|ext| ext != "jsonl").unwrap_or(true) {
                return None;
            }
            let id = path.file_stem()?.to_str()?.parse::<Uuid>().ok()?;
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, id))
        })
        .collect();
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(entries.into_iter().map(|(_, id)| id).collect())
}
