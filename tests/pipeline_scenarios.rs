//! End-to-end session scenarios against scripted oracles.
//!
//! Each test drives a real `PhaseOrchestrator` session on its own task and
//! folds the resulting stream into a `ClientStore` the way a client would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln::audit::{AuditKind, MemoryAudit};
use kiln::client::ClientStore;
use kiln::errors::OracleError;
use kiln::oracle::scripted::{ScriptedCompletionOracle, ScriptedValidator};
use kiln::oracle::{Completion, CompletionOracle, CompletionRequest};
use kiln::pipeline::emitter::EVENT_BUFFER;
use kiln::pipeline::{AdmissionControl, PhaseOrchestrator, PipelineSettings, SessionHandle, SessionOutcome};
use kiln_common::{ArtifactMode, ConversionEvent, SessionStatus};
use serde_json::{Value, json};

const SOURCE: &str = "contract Token { mapping(address => uint256) balances; }";

fn settings(max_attempts: u32) -> PipelineSettings {
    PipelineSettings {
        max_attempts,
        session_timeout: Duration::from_secs(10),
        min_source_chars: 10,
        max_source_chars: 10_000,
    }
}

struct Harness {
    completion: Arc<ScriptedCompletionOracle>,
    validator: Arc<ScriptedValidator>,
    audit: Arc<MemoryAudit>,
    orchestrator: PhaseOrchestrator,
    admission: AdmissionControl,
}

fn harness(completion: ScriptedCompletionOracle, validator: ScriptedValidator, max_attempts: u32) -> Harness {
    let completion = Arc::new(completion);
    let validator = Arc::new(validator);
    let audit = Arc::new(MemoryAudit::new());
    let orchestrator = PhaseOrchestrator::new(
        completion.clone(),
        validator.clone(),
        audit.clone(),
        settings(max_attempts),
    );
    Harness {
        completion,
        validator,
        audit,
        orchestrator,
        admission: AdmissionControl::new(2),
    }
}

impl Harness {
    fn start(&self) -> SessionHandle {
        let permit = self.admission.try_admit().unwrap();
        self.orchestrator.start(SOURCE.to_string(), permit).unwrap()
    }
}

fn analysis() -> Value {
    json!({"summary": "token ledger", "state": ["balances"]})
}

fn plan(names: &[&str]) -> Value {
    let contracts: Vec<Value> = names
        .iter()
        .map(|name| json!({"name": name, "description": format!("{} contract", name)}))
        .collect();
    json!({
        "contracts": contracts,
        "transactions": [{"name": "transfer", "contracts": names}]
    })
}

fn contracts(pairs: &[(&str, &str)]) -> Value {
    let contracts: Vec<Value> = pairs
        .iter()
        .map(|(name, code)| json!({"name": name, "code": code}))
        .collect();
    json!({ "contracts": contracts })
}

async fn collect(handle: &mut SessionHandle) -> Vec<ConversionEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("session stream did not close")
}

fn names(events: &[ConversionEvent]) -> Vec<&'static str> {
    events.iter().map(ConversionEvent::name).collect()
}

fn ready_names(events: &[ConversionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ConversionEvent::ArtifactReady { artifact } => Some(artifact.name.clone()),
            _ => None,
        })
        .collect()
}

fn fold(events: &[ConversionEvent]) -> ClientStore {
    let mut store = ClientStore::for_epoch(1);
    for event in events {
        store.apply(event);
    }
    store
}

fn assert_single_terminal(events: &[ConversionEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "events: {:?}", names(events));
    assert!(events.last().unwrap().is_terminal());
}

// =============================================================================
// Happy paths
// =============================================================================

#[tokio::test]
async fn single_artifact_valid_on_first_attempt() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token"]))
            .reply(json!({"code": "export ledger balances: Map<Bytes<32>, Uint<64>>;"})),
        ScriptedValidator::accepting(),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;

    assert_eq!(
        names(&events),
        vec![
            "phase1_start",
            "phase1_complete",
            "phase2_start",
            "phase2_complete",
            "phase3_start",
            "validation",
            "artifact_ready",
            "done"
        ]
    );
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);

    match &events[5] {
        ConversionEvent::Validation(report) => {
            assert!(report.passed);
            assert_eq!(report.valid_count, 1);
        }
        other => panic!("expected validation, got {:?}", other),
    }
    match events.last().unwrap() {
        ConversionEvent::Done { result } => {
            assert_eq!(result.session_id, handle.session_id);
            assert_eq!(result.mode, ArtifactMode::Single);
            assert_eq!(result.attempts, 1);
            assert_eq!(result.artifacts.len(), 1);
            assert_eq!(result.artifacts[0].name, "Token");
            assert_eq!(result.transactions[0].name, "transfer");
            assert_eq!(result.usage.total(), 60);
        }
        other => panic!("expected done, got {:?}", other),
    }

    let store = fold(&events);
    assert_eq!(store.status, SessionStatus::Complete);
    assert_eq!(store.contracts.len(), 1);
    assert!(store.contracts[0].validated);
    assert_eq!(h.validator.calls(), 1);
    assert_eq!(h.admission.active(), 0);
}

#[tokio::test]
async fn repair_fixes_only_the_failed_artifact() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "Vault"]))
            .reply(contracts(&[("Token", "token ok"), ("Vault", "vault BROKEN")]))
            .reply(contracts(&[("Vault", "vault fixed")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);

    assert_eq!(
        names(&events)[4..],
        [
            "phase3_start",
            "validation",
            "artifact_ready",
            "phase4_start",
            "validation",
            "artifact_ready",
            "done"
        ]
    );
    assert_eq!(ready_names(&events), vec!["Token", "Vault"]);

    match &events[7] {
        ConversionEvent::Phase4Start { attempt, retrying } => {
            assert_eq!(*attempt, 2);
            assert_eq!(retrying, &vec!["Vault".to_string()]);
        }
        other => panic!("expected phase4_start, got {:?}", other),
    }

    // Accepted code is never resubmitted to the oracle or the validator.
    let repair = &h.completion.requests()[3];
    assert!(repair.user_message.contains("vault BROKEN"));
    assert!(!repair.user_message.contains("token ok"));
    assert_eq!(h.validator.seen(), vec!["token ok", "vault BROKEN", "vault fixed"]);

    match events.last().unwrap() {
        ConversionEvent::Done { result } => {
            let order: Vec<_> = result.artifacts.iter().map(|a| (a.name.as_str(), a.order)).collect();
            assert_eq!(order, vec![("Token", 0), ("Vault", 1)]);
            assert!(result.artifacts.iter().all(|a| a.validated));
            assert_eq!(result.artifacts[0].attempt, 1);
            assert_eq!(result.artifacts[1].attempt, 2);
            assert_eq!(result.artifacts[1].code, "vault fixed");
            assert_eq!(result.mode, ArtifactMode::Multi);
            assert_eq!(result.attempts, 2);
        }
        other => panic!("expected done, got {:?}", other),
    }

    let store = fold(&events);
    assert_eq!(store.status, SessionStatus::Complete);
    assert_eq!(store.contracts.len(), 2);
}

#[tokio::test]
async fn resent_accepted_artifact_is_not_replaced() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "Vault"]))
            .reply(contracts(&[("Token", "token ok"), ("Vault", "vault BROKEN")]))
            .reply(contracts(&[("Token", "token rewritten"), ("Vault", "vault fixed")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;

    assert_eq!(ready_names(&events), vec!["Token", "Vault"]);
    match events.last().unwrap() {
        ConversionEvent::Done { result } => {
            assert_eq!(result.artifacts[0].code, "token ok");
            assert_eq!(result.artifacts[0].attempt, 1);
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert!(!h.validator.seen().contains(&"token rewritten".to_string()));
}

#[tokio::test]
async fn drifted_repair_name_is_reconciled() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "TokenVault"]))
            .reply(contracts(&[("Token", "token ok"), ("TokenVault", "vault BROKEN")]))
            .reply(contracts(&[("token_vault", "vault fixed")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);

    assert_eq!(ready_names(&events), vec!["Token", "TokenVault"]);
    match events.last().unwrap() {
        ConversionEvent::Done { result } => {
            assert_eq!(result.artifacts[1].name, "TokenVault");
            assert_eq!(result.artifacts[1].code, "vault fixed");
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_repair_call_consumes_an_attempt() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "Vault"]))
            .reply(contracts(&[("Token", "token ok"), ("Vault", "vault BROKEN")]))
            .fail(OracleError::Unavailable("rate limited".into()))
            .reply(contracts(&[("Vault", "vault fixed")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);

    let reports: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ConversionEvent::Validation(report) => Some(report.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 3);
    assert!(reports[1].error.as_deref().unwrap().contains("rate limited"));
    assert!(!reports[1].passed);
    assert!(reports[2].passed);
    assert_eq!(reports[2].attempt, 3);
    assert_eq!(ready_names(&events), vec!["Token", "Vault"]);
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn exhausted_attempts_keep_partial_success() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "Vault", "Escrow"]))
            .reply(contracts(&[
                ("Token", "token ok"),
                ("Vault", "vault BROKEN"),
                ("Escrow", "escrow BROKEN"),
            ]))
            .reply(contracts(&[("Vault", "vault BROKEN 2"), ("Escrow", "escrow BROKEN 2")]))
            .reply(contracts(&[("Vault", "vault BROKEN 3"), ("Escrow", "escrow BROKEN 3")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Failed);

    assert_single_terminal(&events);
    let attempts = events
        .iter()
        .filter(|e| matches!(e, ConversionEvent::Phase3Start { .. } | ConversionEvent::Phase4Start { .. }))
        .count();
    assert_eq!(attempts, 3);
    assert_eq!(h.completion.calls(), 5);
    assert_eq!(ready_names(&events), vec!["Token"]);

    match events.last().unwrap() {
        ConversionEvent::Error { message, phase, detail } => {
            assert_eq!(*phase, Some(4));
            assert_eq!(detail.as_deref(), Some("attempts_exhausted"));
            assert!(message.contains("Vault"));
        }
        other => panic!("expected error, got {:?}", other),
    }

    let store = fold(&events);
    assert_eq!(store.status, SessionStatus::Error);
    assert!(store.error.is_some());
    assert_eq!(store.contracts.len(), 1);
    assert_eq!(store.contracts[0].name, "Token");
    assert!(store.contracts[0].validated);
}

#[tokio::test]
async fn missing_repair_artifact_is_an_integrity_failure() {
    let h = harness(
        ScriptedCompletionOracle::new()
            .reply(analysis())
            .reply(plan(&["Token", "Vault", "Escrow"]))
            .reply(contracts(&[
                ("Token", "token ok"),
                ("Vault", "vault BROKEN"),
                ("Escrow", "escrow BROKEN"),
            ]))
            .reply(contracts(&[("Vault", "vault fixed")])),
        ScriptedValidator::rejecting("BROKEN"),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Failed);

    assert_single_terminal(&events);
    match events.last().unwrap() {
        ConversionEvent::Error { detail, .. } => {
            assert_eq!(detail.as_deref(), Some("merge_integrity"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    // The failed merge never reaches validation.
    assert_eq!(h.validator.calls(), 3);
}

#[tokio::test]
async fn analysis_failure_is_fatal_in_phase_one() {
    let h = harness(
        ScriptedCompletionOracle::new().fail(OracleError::Unavailable("connection reset".into())),
        ScriptedValidator::accepting(),
        3,
    );
    let mut handle = h.start();
    let events = collect(&mut handle).await;

    assert_eq!(names(&events), vec!["phase1_start", "error"]);
    match &events[1] {
        ConversionEvent::Error { phase, detail, .. } => {
            assert_eq!(*phase, Some(1));
            assert_eq!(detail.as_deref(), Some("oracle"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(h.completion.calls(), 1);
}

// =============================================================================
// Cancellation, timeout, and supervision
// =============================================================================

#[tokio::test]
async fn cancel_after_phase_two_stops_before_validation() {
    let completion = ScriptedCompletionOracle::new()
        .reply(analysis())
        .reply(plan(&["Token"]))
        .reply(json!({"code": "first session"}))
        .reply(analysis())
        .reply(plan(&["Ledger"]))
        .reply(json!({"code": "second session"}));
    let gate = completion.hold_call(3);
    let h = harness(completion, ScriptedValidator::accepting(), 3);

    let mut first = h.start();
    loop {
        let event = first.events.recv().await.unwrap();
        if matches!(event, ConversionEvent::Phase3Start { .. }) {
            break;
        }
    }
    while h.completion.calls() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first_id = first.session_id;
    drop(first.events);
    gate.notify_one();
    assert_eq!(first.task.await.unwrap(), SessionOutcome::Cancelled);
    assert_eq!(h.validator.calls(), 0);
    assert_eq!(h.admission.active(), 0);

    let cancelled = h.audit.records().into_iter().any(|r| {
        r.session_id == first_id
            && matches!(&r.kind, AuditKind::SessionFinished { error: Some(e), .. } if e == "cancelled")
    });
    assert!(cancelled);

    let mut second = h.start();
    let events = collect(&mut second).await;
    assert_eq!(second.task.await.unwrap(), SessionOutcome::Completed);
    assert_ne!(second.session_id, first_id);
    match &events[0] {
        ConversionEvent::Phase1Start { session_id } => assert_eq!(*session_id, second.session_id),
        other => panic!("expected phase1_start, got {:?}", other),
    }
    match events.last().unwrap() {
        ConversionEvent::Done { result } => {
            assert_eq!(result.session_id, second.session_id);
            assert_eq!(result.artifacts[0].name, "Ledger");
            assert_eq!(result.artifacts[0].code, "second session");
        }
        other => panic!("expected done, got {:?}", other),
    }
    assert_eq!(h.validator.seen(), vec!["second session"]);
}

#[tokio::test]
async fn session_timeout_closes_stream_with_error() {
    let completion = ScriptedCompletionOracle::new().reply(analysis());
    let _gate = completion.hold_call(1);
    let completion = Arc::new(completion);
    let audit = Arc::new(MemoryAudit::new());
    let orchestrator = PhaseOrchestrator::new(
        completion,
        Arc::new(ScriptedValidator::accepting()),
        audit.clone(),
        PipelineSettings {
            session_timeout: Duration::from_millis(100),
            ..settings(3)
        },
    );
    let admission = AdmissionControl::new(1);
    let mut handle = orchestrator
        .start(SOURCE.to_string(), admission.try_admit().unwrap())
        .unwrap();

    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::TimedOut);
    assert_eq!(names(&events), vec!["phase1_start", "error"]);
    match &events[1] {
        ConversionEvent::Error { detail, .. } => assert_eq!(detail.as_deref(), Some("timeout")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(admission.active(), 0);
    let finished = audit
        .records()
        .iter()
        .filter(|r| matches!(r.kind, AuditKind::SessionFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

/// A session producing `count` valid contracts under a short budget.
fn many_contracts_session(
    count: usize,
    budget: Duration,
) -> (PhaseOrchestrator, Arc<MemoryAudit>, AdmissionControl) {
    let names: Vec<String> = (0..count).map(|i| format!("Part{:02}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let pairs: Vec<(&str, &str)> = refs.iter().map(|name| (*name, "export ledger x;")).collect();
    let completion = ScriptedCompletionOracle::new()
        .reply(analysis())
        .reply(plan(&refs))
        .reply(contracts(&pairs));
    let audit = Arc::new(MemoryAudit::new());
    let orchestrator = PhaseOrchestrator::new(
        Arc::new(completion),
        Arc::new(ScriptedValidator::accepting()),
        audit.clone(),
        PipelineSettings {
            session_timeout: budget,
            ..settings(3)
        },
    );
    (orchestrator, audit, AdmissionControl::new(1))
}

#[tokio::test]
async fn slow_reader_still_receives_done() {
    // Six progress events plus one artifact_ready per contract fill the
    // buffer exactly, so `done` has to wait for the reader.
    let (orchestrator, audit, admission) =
        many_contracts_session(EVENT_BUFFER - 6, Duration::from_millis(300));
    let mut handle = orchestrator
        .start(SOURCE.to_string(), admission.try_admit().unwrap())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);

    assert_eq!(events.len(), EVENT_BUFFER + 1);
    assert_single_terminal(&events);
    assert_eq!(events.last().unwrap().name(), "done");

    let finished: Vec<_> = audit
        .records()
        .into_iter()
        .filter_map(|r| match r.kind {
            AuditKind::SessionFinished { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![SessionStatus::Complete]);
    assert_eq!(admission.active(), 0);
}

#[tokio::test]
async fn timeout_while_blocked_on_a_full_buffer_still_terminates() {
    let (orchestrator, _audit, admission) =
        many_contracts_session(EVENT_BUFFER + 10, Duration::from_millis(300));
    let mut handle = orchestrator
        .start(SOURCE.to_string(), admission.try_admit().unwrap())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::TimedOut);

    assert_single_terminal(&events);
    match events.last().unwrap() {
        ConversionEvent::Error { detail, .. } => assert_eq!(detail.as_deref(), Some("timeout")),
        other => panic!("expected error, got {:?}", other),
    }
    let ready = ready_names(&events);
    let mut unique = ready.clone();
    unique.dedup();
    assert_eq!(ready, unique);
    assert!(ready.len() < EVENT_BUFFER + 10);
    assert_eq!(admission.active(), 0);
}

struct PanickingOracle;

#[async_trait]
impl CompletionOracle for PanickingOracle {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, OracleError> {
        panic!("oracle bug");
    }
}

#[tokio::test]
async fn panicking_session_still_terminates_stream() {
    let orchestrator = PhaseOrchestrator::new(
        Arc::new(PanickingOracle),
        Arc::new(ScriptedValidator::accepting()),
        Arc::new(MemoryAudit::new()),
        settings(3),
    );
    let admission = AdmissionControl::new(1);
    let mut handle = orchestrator
        .start(SOURCE.to_string(), admission.try_admit().unwrap())
        .unwrap();

    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Panicked);
    assert_single_terminal(&events);
    match events.last().unwrap() {
        ConversionEvent::Error { detail, .. } => assert_eq!(detail.as_deref(), Some("internal")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(admission.active(), 0);
}

#[tokio::test]
async fn admission_slot_is_held_for_the_session_lifetime() {
    let completion = ScriptedCompletionOracle::new()
        .reply(analysis())
        .reply(plan(&["Token"]))
        .reply(json!({"code": "ok"}));
    let gate = completion.hold_call(1);
    let orchestrator = PhaseOrchestrator::new(
        Arc::new(completion),
        Arc::new(ScriptedValidator::accepting()),
        Arc::new(MemoryAudit::new()),
        settings(3),
    );
    let admission = AdmissionControl::new(1);
    let mut handle = orchestrator
        .start(SOURCE.to_string(), admission.try_admit().unwrap())
        .unwrap();

    assert_eq!(admission.active(), 1);
    assert!(admission.try_admit().is_none());

    gate.notify_one();
    let events = collect(&mut handle).await;
    assert_eq!(handle.task.await.unwrap(), SessionOutcome::Completed);
    assert_eq!(events.last().unwrap().name(), "done");
    assert_eq!(admission.active(), 0);
    assert!(admission.try_admit().is_some());
}
