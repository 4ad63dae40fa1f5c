//! Deterministic oracles for tests and `kiln serve --offline`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kiln_common::Usage;
use serde_json::{Value, json};
use tokio::sync::Notify;

use super::{
    Completion, CompletionOracle, CompletionRequest, Stage, ValidationOracle, ValidationOutcome,
};
use crate::errors::OracleError;

/// Replays a fixed queue of completion replies, one per call.
///
/// Every request is recorded so tests can assert on prompt contents. A call
/// can be held until the test releases it, which pins down where a session
/// is when the client disconnects.
#[derive(Default)]
pub struct ScriptedCompletionOracle {
    replies: Mutex<VecDeque<Result<Value, OracleError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    gates: Mutex<Vec<(usize, Arc<Notify>)>>,
    calls: AtomicUsize,
}

impl ScriptedCompletionOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, data: Value) -> Self {
        self.push(Ok(data));
        self
    }

    pub fn fail(self, error: OracleError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, reply: Result<Value, OracleError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Hold the `call`-th call (1-based) until the returned handle is notified.
    pub fn hold_call(&self, call: usize) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Ok(mut gates) = self.gates.lock() {
            gates.push((call, gate.clone()));
        }
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn gate_for(&self, call: usize) -> Option<Arc<Notify>> {
        self.gates.lock().ok().and_then(|gates| {
            gates
                .iter()
                .find(|(n, _)| *n == call)
                .map(|(_, gate)| gate.clone())
        })
    }
}

#[async_trait]
impl CompletionOracle for ScriptedCompletionOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, OracleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(gate) = self.gate_for(call) {
            gate.notified().await;
        }
        let reply = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Err(OracleError::Unavailable("script exhausted".into())));
        reply.map(|data| Completion {
            data,
            usage: Usage::new(10, 10),
        })
    }
}

type Rule = dyn Fn(&str) -> Result<ValidationOutcome, OracleError> + Send + Sync;

/// Validator driven by a rule over the code text. Counts calls.
pub struct ScriptedValidator {
    rule: Box<Rule>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedValidator {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&str) -> Result<ValidationOutcome, OracleError> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Code containing `marker` is invalid; everything else is valid.
    pub fn rejecting(marker: &'static str) -> Self {
        Self::new(move |code| {
            Ok(if code.contains(marker) {
                ValidationOutcome::Invalid {
                    error: format!("found {}", marker),
                }
            } else {
                ValidationOutcome::Valid {
                    size: code.len() as u64,
                    metadata: None,
                }
            })
        })
    }

    pub fn accepting() -> Self {
        Self::new(|code| {
            Ok(ValidationOutcome::Valid {
                size: code.len() as u64,
                metadata: None,
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Code of every validated artifact, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ValidationOracle for ScriptedValidator {
    async fn validate(&self, code: &str) -> Result<ValidationOutcome, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(code.to_string());
        }
        (self.rule)(code)
    }
}

/// Offline completion oracle: a fixed analysis and plan, then the source
/// echoed back as a single artifact.
pub struct EchoCompletionOracle;

#[async_trait]
impl CompletionOracle for EchoCompletionOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, OracleError> {
        let data = match request.stage {
            Stage::Analysis => json!({
                "summary": "offline analysis",
                "source_chars": request.user_message.chars().count(),
            }),
            Stage::Plan => json!({
                "contracts": [{
                    "name": "Main",
                    "description": "Offline echo of the submitted source",
                    "responsibilities": "none"
                }],
                "transactions": []
            }),
            Stage::Generate | Stage::Repair => json!({
                "code": format!("// offline echo\n{}", request.user_message),
            }),
        };
        Ok(Completion {
            data,
            usage: Usage::default(),
        })
    }
}
