//! Audit trail inspection (`kiln audit`).

use anyhow::{Context, Result};
use console::style;
use uuid::Uuid;

use super::super::AuditCommands;
use kiln::audit::AuditKind;
use kiln::audit::logger::{list_sessions, load_session};
use kiln::config::KilnConfig;

pub fn cmd_audit(config: &KilnConfig, command: &AuditCommands) -> Result<()> {
    let dir = &config.audit.dir;

    match command {
        AuditCommands::Show { session_id } => {
            let id: Uuid = session_id
                .parse()
                .with_context(|| format!("'{}' is not a session id", session_id))?;
            let records = load_session(dir, &id)?;

            println!("Session {}", style(id).bold());
            for record in records {
                let at = record.at.format("%H:%M:%S%.3f");
                let line = match record.kind {
                    AuditKind::SessionStarted { source_chars } => {
                        format!("started ({} chars of source)", source_chars)
                    }
                    AuditKind::OracleCall {
                        phase,
                        attempt,
                        duration_ms,
                        usage,
                        error,
                    } => {
                        let attempt = attempt.map(|a| format!(" attempt {}", a)).unwrap_or_default();
                        match error {
                            Some(e) => format!(
                                "phase {}{} oracle call failed after {}ms: {}",
                                phase,
                                attempt,
                                duration_ms,
                                style(e).red()
                            ),
                            None => format!(
                                "phase {}{} oracle call {}ms, {} tokens",
                                phase,
                                attempt,
                                duration_ms,
                                usage.total()
                            ),
                        }
                    }
                    AuditKind::ArtifactPersisted {
                        name,
                        attempt,
                        size,
                        ..
                    } => format!(
                        "{} {} (attempt {}, {} bytes)",
                        style("artifact").green(),
                        name,
                        attempt,
                        size.unwrap_or(0)
                    ),
                    AuditKind::SessionFinished {
                        status,
                        attempts,
                        error,
                    } => match error {
                        Some(e) => format!("finished {} after {} attempt(s): {}", status, attempts, e),
                        None => format!("finished {} after {} attempt(s)", status, attempts),
                    },
                };
                println!("  {} {}", style(at).dim(), line);
            }
        }
        AuditCommands::List => {
            let sessions = list_sessions(dir)?;
            if sessions.is_empty() {
                println!("No audited sessions in {}", dir.display());
            }
            for id in sessions {
                println!("{}", id);
            }
        }
    }
    Ok(())
}
