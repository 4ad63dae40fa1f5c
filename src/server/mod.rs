//! HTTP transport: NDJSON and WebSocket conversion streams plus health.

pub mod api;
pub mod stream;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::{AuditSink, JsonlAuditLogger, NoopAudit};
use crate::config::KilnConfig;
use crate::oracle::scripted::{EchoCompletionOracle, ScriptedValidator};
use crate::oracle::{ClaudeCliOracle, CommandValidator, CompletionOracle, ValidationOracle};
use crate::pipeline::{AdmissionControl, PhaseOrchestrator, PipelineSettings};
pub use api::{AppState, SharedState};

/// How long shutdown waits for queued audit records to reach disk.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime switches for `kiln serve` that are not part of `kiln.toml`.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Use built-in echo oracles instead of the Claude CLI and compiler.
    pub offline: bool,
    /// Permissive CORS for a locally served frontend.
    pub dev_mode: bool,
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    let body_limit = api::body_limit(state.orchestrator.settings());
    api::api_router(body_limit)
        .route("/api/convert/ws", get(ws::convert_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire oracles, audit sink, and admission control from configuration.
///
/// The returned handle is the audit writer task, when auditing is enabled.
pub fn build_state(
    config: &KilnConfig,
    options: &ServeOptions,
) -> Result<(SharedState, Option<JoinHandle<()>>)> {
    let (completion, validator): (Arc<dyn CompletionOracle>, Arc<dyn ValidationOracle>) =
        if options.offline {
            tracing::warn!("offline mode: using echo oracles");
            (Arc::new(EchoCompletionOracle), Arc::new(ScriptedValidator::accepting()))
        } else {
            (
                Arc::new(ClaudeCliOracle::from_config(&config.oracle)),
                Arc::new(CommandValidator::from_config(&config.validator)),
            )
        };

    let (audit, writer): (Arc<dyn AuditSink>, Option<JoinHandle<()>>) = if config.audit.enabled {
        let (logger, writer) = JsonlAuditLogger::spawn(&config.audit.dir)?;
        (Arc::new(logger), Some(writer))
    } else {
        (Arc::new(NoopAudit), None)
    };

    let orchestrator = PhaseOrchestrator::new(
        completion,
        validator,
        audit,
        PipelineSettings::from_config(config),
    );
    let state = Arc::new(AppState {
        orchestrator,
        admission: AdmissionControl::new(config.server.max_sessions),
    });
    Ok((state, writer))
}

/// Start the kiln server and run until Ctrl+C.
pub async fn start_server(config: &KilnConfig, options: ServeOptions) -> Result<()> {
    let (state, audit_writer) = build_state(config, &options)?;

    let mut app = build_router(state);
    if options.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        max_sessions = config.server.max_sessions,
        max_attempts = config.pipeline.max_attempts,
        offline = options.offline,
        "kiln listening"
    );
    println!("kiln running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(writer) = audit_writer {
        if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await.is_err() {
            tracing::warn!("audit writer did not drain before shutdown");
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
