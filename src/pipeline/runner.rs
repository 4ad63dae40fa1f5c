use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kiln_common::{ArtifactMode, ConversionEvent, ConversionResult, SessionStatus, ValidationReport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::admission::AdmissionPermit;
use super::emitter::{Disconnected, EVENT_BUFFER, EventEmitter};
use super::merge::merge;
use super::prompts;
use super::session::{GenerationOutput, Plan, SessionState};
use crate::audit::{AuditKind, AuditRecord, AuditSink};
use crate::config::KilnConfig;
use crate::errors::{InputError, MergeError, OracleError, PipelineError};
use crate::oracle::{Completion, CompletionOracle, CompletionRequest, ValidationOracle, ValidationOutcome};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub session_timeout: Duration,
    pub min_source_chars: usize,
    pub max_source_chars: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            max_attempts: config.pipeline.max_attempts,
            session_timeout: config.session_timeout(),
            min_source_chars: config.limits.min_source_chars,
            max_source_chars: config.limits.max_source_chars,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&KilnConfig::default())
    }
}

/// How a session ended, as seen by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Panicked,
}

/// A running session: its id, its event stream, and its supervisor task.
///
/// Dropping `events` cancels the session at its next checkpoint.
pub struct SessionHandle {
    pub session_id: Uuid,
    pub events: mpsc::Receiver<ConversionEvent>,
    pub task: JoinHandle<SessionOutcome>,
}

/// How `run_session` finished, and the terminal event still to be sent.
struct SessionEnd {
    outcome: SessionOutcome,
    terminal: Option<ConversionEvent>,
}

/// Why a session stopped short of completion.
enum Halt {
    Cancelled,
    Failed(PipelineError),
}

impl From<Disconnected> for Halt {
    fn from(_: Disconnected) -> Self {
        Halt::Cancelled
    }
}

/// Why one generation attempt produced no usable artifacts.
///
/// Oracle failures consume the attempt; merge failures end the session.
enum AttemptFailure {
    Oracle(OracleError),
    Merge(MergeError),
}

impl From<OracleError> for AttemptFailure {
    fn from(e: OracleError) -> Self {
        AttemptFailure::Oracle(e)
    }
}

impl From<MergeError> for AttemptFailure {
    fn from(e: MergeError) -> Self {
        AttemptFailure::Merge(e)
    }
}

impl From<PipelineError> for Halt {
    fn from(e: PipelineError) -> Self {
        Halt::Failed(e)
    }
}

/// Drives sessions through analysis, planning, generation, and repair.
#[derive(Clone)]
pub struct PhaseOrchestrator {
    completion: Arc<dyn CompletionOracle>,
    validator: Arc<dyn ValidationOracle>,
    audit: Arc<dyn AuditSink>,
    settings: PipelineSettings,
}

impl PhaseOrchestrator {
    pub fn new(
        completion: Arc<dyn CompletionOracle>,
        validator: Arc<dyn ValidationOracle>,
        audit: Arc<dyn AuditSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            completion,
            validator,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Ingress checks, applied before any oracle is called.
    pub fn check_input(&self, source: &str) -> Result<(), InputError> {
        if source.trim().is_empty() {
            return Err(InputError::Empty);
        }
        let actual = source.chars().count();
        if actual > self.settings.max_source_chars {
            return Err(InputError::TooLarge {
                max: self.settings.max_source_chars,
                actual,
            });
        }
        if actual < self.settings.min_source_chars {
            return Err(InputError::TooShort {
                min: self.settings.min_source_chars,
                actual,
            });
        }
        Ok(())
    }

    /// Validate `source` and start a session on its own task.
    ///
    /// The permit is held by the supervisor and released however the
    /// session ends.
    pub fn start(&self, source: String, permit: AdmissionPermit) -> Result<SessionHandle, InputError> {
        self.check_input(&source)?;
        Ok(self.spawn_session(source, permit))
    }

    fn spawn_session(&self, source: String, permit: AdmissionPermit) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let emitter = EventEmitter::new(session_id, tx);
        let terminal = emitter.terminal_handle();
        let span = tracing::info_span!("session", session_id = %session_id);

        let budget = self.settings.session_timeout;
        let runner = self.clone();
        let inner = tokio::spawn(
            async move {
                tokio::time::timeout(budget, runner.run_session(session_id, source, emitter)).await
            }
            .instrument(span.clone()),
        );

        let audit = self.audit.clone();
        let task = tokio::spawn(
            async move {
                let _permit = permit;
                match inner.await {
                    Ok(Ok(end)) => {
                        if let Some(event) = end.terminal {
                            let name = event.name();
                            if !terminal.close_with(event).await {
                                tracing::info!(event = name, "client disconnected before the terminal event was delivered");
                            }
                        }
                        end.outcome
                    }
                    Ok(Err(_elapsed)) => {
                        tracing::warn!(timeout_ms = budget.as_millis() as u64, "session timed out");
                        let message = format!("Session exceeded its {:?} time budget", budget);
                        finish_audit(&*audit, session_id, SessionStatus::Error, None, Some(message.clone()));
                        terminal
                            .close_with(ConversionEvent::error(message, None, Some("timeout")))
                            .await;
                        SessionOutcome::TimedOut
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "session task failed");
                        finish_audit(
                            &*audit,
                            session_id,
                            SessionStatus::Error,
                            None,
                            Some("internal error".into()),
                        );
                        terminal
                            .close_with(ConversionEvent::error(
                                "Internal error while converting",
                                None,
                                Some("internal"),
                            ))
                            .await;
                        SessionOutcome::Panicked
                    }
                }
            }
            .instrument(span),
        );

        SessionHandle {
            session_id,
            events: rx,
            task,
        }
    }

    /// Run the phases and decide how the session ends. The terminal event
    /// is handed back to the supervisor, which sends it outside the time
    /// budget.
    async fn run_session(&self, session_id: Uuid, source: String, mut emitter: EventEmitter) -> SessionEnd {
        let mut state = SessionState::new(session_id);
        self.audit.record(AuditRecord::new(
            session_id,
            AuditKind::SessionStarted {
                source_chars: source.chars().count(),
            },
        ));
        tracing::info!(source_chars = source.chars().count(), "session started");

        match self.drive(&mut state, &source, &mut emitter).await {
            Ok(result) => {
                state.status = SessionStatus::Complete;
                finish_audit(&*self.audit, session_id, state.status, Some(state.attempt), None);
                tracing::info!(
                    attempts = result.attempts,
                    artifacts = result.artifacts.len(),
                    "session complete"
                );
                SessionEnd {
                    outcome: SessionOutcome::Completed,
                    terminal: Some(ConversionEvent::Done { result }),
                }
            }
            Err(Halt::Failed(error)) => {
                let phase = error.phase().or(state.status.phase());
                tracing::warn!(phase = ?phase, detail = error.detail(), error = %error, "session failed");
                state.status = SessionStatus::Error;
                finish_audit(
                    &*self.audit,
                    session_id,
                    state.status,
                    Some(state.attempt),
                    Some(error.to_string()),
                );
                SessionEnd {
                    outcome: SessionOutcome::Failed,
                    terminal: Some(ConversionEvent::error(error.to_string(), phase, Some(error.detail()))),
                }
            }
            Err(Halt::Cancelled) => {
                tracing::info!(status = %state.status, attempt = state.attempt, "client disconnected; session cancelled");
                finish_audit(
                    &*self.audit,
                    session_id,
                    state.status,
                    Some(state.attempt),
                    Some("cancelled".into()),
                );
                SessionEnd {
                    outcome: SessionOutcome::Cancelled,
                    terminal: None,
                }
            }
        }
    }

    async fn drive(
        &self,
        state: &mut SessionState,
        source: &str,
        emitter: &mut EventEmitter,
    ) -> Result<ConversionResult, Halt> {
        state.status = SessionStatus::Phase1;
        emitter
            .emit(ConversionEvent::Phase1Start {
                session_id: state.id,
            })
            .await?;
        checkpoint(emitter, "analysis")?;
        let analysis = self
            .call(state, prompts::analysis_request(source), None)
            .await
            .map_err(|source| PipelineError::Oracle { phase: 1, source })?;
        state.analysis = analysis.data.clone();
        emitter
            .emit(ConversionEvent::Phase1Complete {
                analysis: analysis.data,
                usage: analysis.usage,
            })
            .await?;

        state.status = SessionStatus::Phase2;
        emitter.emit(ConversionEvent::Phase2Start).await?;
        checkpoint(emitter, "plan")?;
        let request = prompts::plan_request(source, &state.analysis);
        let planned = self
            .call(state, request, None)
            .await
            .and_then(|c| Ok((Plan::parse(c.data)?, c.usage)))
            .map_err(|source| PipelineError::Oracle { phase: 2, source })?;
        let (plan, usage) = planned;
        tracing::info!(contracts = plan.contracts.len(), transactions = plan.transactions.len(), "plan ready");
        state.plan = plan;
        emitter
            .emit(ConversionEvent::Phase2Complete {
                contracts: state.plan.contracts.clone(),
                transactions: state.plan.transactions.clone(),
                usage,
            })
            .await?;

        self.repair_loop(state, source, emitter).await
    }

    async fn repair_loop(
        &self,
        state: &mut SessionState,
        source: &str,
        emitter: &mut EventEmitter,
    ) -> Result<ConversionResult, Halt> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::from("no generation attempt completed");

        for attempt in 1..=max_attempts {
            state.attempt = attempt;
            let fresh = state.mode.is_none();

            if attempt == 1 {
                state.status = SessionStatus::Phase3;
                emitter.emit(ConversionEvent::Phase3Start { attempt }).await?;
            } else {
                state.status = SessionStatus::Phase4;
                let retrying = state.retry_batch().iter().map(|a| a.name.clone()).collect();
                emitter
                    .emit(ConversionEvent::Phase4Start { attempt, retrying })
                    .await?;
            }

            checkpoint(emitter, "generate")?;
            let request = match state.mode {
                None => prompts::generation_request(source, &state.analysis, &state.plan),
                Some(mode) => prompts::repair_request(mode, &state.retry_batch()),
            };

            let applied = match self.call(state, request, Some(attempt)).await {
                Ok(completion) => self.apply_output(state, completion, fresh),
                Err(e) => Err(AttemptFailure::Oracle(e)),
            };
            match applied {
                Ok(()) => {}
                Err(AttemptFailure::Merge(e)) => return Err(Halt::Failed(e.into())),
                Err(AttemptFailure::Oracle(e)) => {
                    tracing::warn!(attempt, error = %e, "generation attempt failed");
                    last_error = e.to_string();
                    let report =
                        ValidationReport::from_artifacts(attempt, &state.artifacts, Some(last_error.clone()));
                    emitter.emit(ConversionEvent::Validation(report)).await?;
                    continue;
                }
            }

            self.validate_attempt(state, emitter).await?;

            let report = ValidationReport::from_artifacts(attempt, &state.artifacts, None);
            tracing::info!(
                attempt,
                valid = report.valid_count,
                failed = report.failed_count,
                "attempt validated"
            );
            emitter.emit(ConversionEvent::Validation(report)).await?;

            for artifact in &state.artifacts {
                if emitter.artifact_ready(artifact).await? {
                    self.audit.record(AuditRecord::new(
                        state.id,
                        AuditKind::ArtifactPersisted {
                            name: artifact.name.clone(),
                            attempt: artifact.attempt,
                            size: artifact.size,
                            code_chars: artifact.code.chars().count(),
                        },
                    ));
                }
            }

            if state.all_valid() {
                return Ok(ConversionResult {
                    session_id: state.id,
                    mode: state.mode.unwrap_or(ArtifactMode::Single),
                    artifacts: state.artifacts.clone(),
                    transactions: state.plan.transactions.clone(),
                    deployment: state.deployment.clone(),
                    attempts: attempt,
                    usage: state.usage,
                    finished_at: Utc::now(),
                });
            }

            if let Some(first) = state.first_error() {
                last_error = first;
            }
        }

        Err(Halt::Failed(PipelineError::AttemptsExhausted {
            attempts: max_attempts,
            first_error: last_error,
        }))
    }

    /// Fold one generation or repair response into the session's artifact set.
    ///
    /// A first response fixes mode and order. Later responses are parsed in
    /// that mode and merged over the accepted artifacts.
    fn apply_output(
        &self,
        state: &mut SessionState,
        completion: Completion,
        fresh: bool,
    ) -> Result<(), AttemptFailure> {
        let attempt = state.attempt;
        let single_name = state.single_artifact_name();

        if fresh {
            let output = GenerationOutput::classify(completion.data)?;
            let mode = output.mode();
            let (artifacts, deployment) = output.into_artifacts(attempt, &single_name);
            tracing::info!(mode = mode.as_str(), artifacts = artifacts.len(), "generation mode fixed");
            state.mode = Some(mode);
            state.order = artifacts.iter().map(|a| a.name.clone()).collect();
            state.artifacts = artifacts;
            state.deployment = deployment;
            return Ok(());
        }

        let mode = state.mode.unwrap_or(ArtifactMode::Single);
        let (batch, _) =
            GenerationOutput::parse_as(mode, completion.data)?.into_artifacts(attempt, &single_name);
        state.artifacts = merge(&state.accepted(), batch, &state.order)?;
        Ok(())
    }

    /// Validate the artifacts produced by the current attempt, in order.
    async fn validate_attempt(&self, state: &mut SessionState, emitter: &EventEmitter) -> Result<(), Halt> {
        let attempt = state.attempt;
        for artifact in state.artifacts.iter_mut().filter(|a| a.attempt == attempt && !a.validated) {
            checkpoint(emitter, "validate")?;
            let outcome = match self.validator.validate(&artifact.code).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(artifact = %artifact.name, error = %e, "validator failed to run");
                    ValidationOutcome::Invalid {
                        error: format!("validator unavailable: {}", e),
                    }
                }
            };
            match outcome {
                ValidationOutcome::Valid { size, metadata } => {
                    tracing::info!(artifact = %artifact.name, attempt, size, "artifact valid");
                    artifact.validated = true;
                    artifact.validation_error = None;
                    artifact.size = Some(size);
                    artifact.metadata = metadata;
                }
                ValidationOutcome::Invalid { error } => {
                    tracing::info!(artifact = %artifact.name, attempt, error = %error, "artifact invalid");
                    artifact.validated = false;
                    artifact.validation_error = Some(error);
                }
            }
        }
        Ok(())
    }

    /// One completion call, audited with its duration and usage.
    async fn call(
        &self,
        state: &mut SessionState,
        request: CompletionRequest,
        attempt: Option<u32>,
    ) -> Result<Completion, OracleError> {
        let phase = state.status.phase().unwrap_or(0);
        let stage = request.stage;
        let started = Instant::now();
        let result = self.completion.complete(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (usage, error) = match &result {
            Ok(completion) => (completion.usage, None),
            Err(e) => (Default::default(), Some(e.to_string())),
        };
        state.usage += usage;
        tracing::debug!(phase, stage = stage.as_str(), duration_ms, tokens = usage.total(), "oracle call finished");
        self.audit.record(AuditRecord::new(
            state.id,
            AuditKind::OracleCall {
                phase,
                attempt,
                duration_ms,
                usage,
                error,
            },
        ));
        result
    }
}

/// Named cancellation point before an oracle call.
fn checkpoint(emitter: &EventEmitter, name: &'static str) -> Result<(), Halt> {
    if emitter.is_disconnected() {
        tracing::debug!(checkpoint = name, "disconnect observed");
        return Err(Halt::Cancelled);
    }
    Ok(())
}

fn finish_audit(
    audit: &dyn AuditSink,
    session_id: Uuid,
    status: SessionStatus,
    attempts: Option<u32>,
    error: Option<String>,
) {
    audit.record(AuditRecord::new(
        session_id,
        AuditKind::SessionFinished {
            status,
            attempts: attempts.unwrap_or(0),
            error,
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::oracle::scripted::{ScriptedCompletionOracle, ScriptedValidator};
    use crate::pipeline::AdmissionControl;
    use serde_json::json;

    fn orchestrator(
        completion: ScriptedCompletionOracle,
        validator: ScriptedValidator,
    ) -> (PhaseOrchestrator, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        let settings = PipelineSettings {
            max_attempts: 2,
            session_timeout: Duration::from_secs(5),
            min_source_chars: 5,
            max_source_chars: 100,
        };
        (
            PhaseOrchestrator::new(Arc::new(completion), Arc::new(validator), audit.clone(), settings),
            audit,
        )
    }

    #[test]
    fn test_check_input_limits() {
        let (orchestrator, _) = orchestrator(ScriptedCompletionOracle::new(), ScriptedValidator::accepting());
        assert_eq!(orchestrator.check_input("   "), Err(InputError::Empty));
        assert_eq!(
            orchestrator.check_input("abc"),
            Err(InputError::TooShort { min: 5, actual: 3 })
        );
        assert_eq!(
            orchestrator.check_input(&"x".repeat(101)),
            Err(InputError::TooLarge { max: 100, actual: 101 })
        );
        assert!(orchestrator.check_input("contract A {}").is_ok());
    }

    #[tokio::test]
    async fn test_rejected_input_makes_no_oracle_calls() {
        let completion = ScriptedCompletionOracle::new().reply(json!({}));
        let audit = Arc::new(MemoryAudit::new());
        let orchestrator = PhaseOrchestrator::new(
            Arc::new(completion),
            Arc::new(ScriptedValidator::accepting()),
            audit.clone(),
            PipelineSettings::default(),
        );
        let admission = AdmissionControl::new(1);
        let result = orchestrator.start(String::new(), admission.try_admit().unwrap());
        assert!(matches!(result, Err(InputError::Empty)));
        assert_eq!(admission.active(), 0);
        assert!(audit.records().is_empty());
    }

    #[tokio::test]
    async fn test_phase_two_malformed_plan_is_fatal() {
        let completion = ScriptedCompletionOracle::new()
            .reply(json!({"summary": "s"}))
            .reply(json!({"contracts": "not a list"}));
        let (orchestrator, audit) = orchestrator(completion, ScriptedValidator::accepting());
        let admission = AdmissionControl::new(1);
        let mut handle = orchestrator
            .start("contract A {}".into(), admission.try_admit().unwrap())
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        assert_eq!(handle.task.await.unwrap(), SessionOutcome::Failed);
        match events.last().unwrap() {
            ConversionEvent::Error { phase, detail, .. } => {
                assert_eq!(*phase, Some(2));
                assert_eq!(detail.as_deref(), Some("oracle"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(!events.iter().any(|e| e.name() == "phase3_start"));
        assert_eq!(admission.active(), 0);

        let finished = audit
            .records()
            .into_iter()
            .filter(|r| matches!(r.kind, AuditKind::SessionFinished { .. }))
            .count();
        assert_eq!(finished, 1);
    }
}
