//! Streaming conversion client command (`kiln convert`).
//!
//! Progress goes to stderr; the final contracts (or JSON result) go to stdout.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use kiln::client::{ClientStore, ConversionClient};
use kiln::config::KilnConfig;
use kiln_common::SessionStatus;

pub async fn cmd_convert(config: &KilnConfig, file: &Path, server: Option<String>, json: bool) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let server = server.unwrap_or_else(|| format!("http://{}", config.bind_addr()));

    let client = ConversionClient::new(server.clone());
    let mut rx = client.subscribe();
    client.start(source);
    eprintln!("{} {}", style("Converting via").dim(), server);

    let mut progress = Progress::default();
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        let store = rx.borrow_and_update().clone();
        progress.report(&store);
        if store.is_finished() {
            break;
        }
    }

    let store = client.snapshot();
    match store.status {
        SessionStatus::Complete => {
            if json {
                println!("{}", serde_json::to_string_pretty(&store.result)?);
            } else {
                for contract in &store.contracts {
                    println!("// ── {} ──", contract.name);
                    println!("{}", contract.code);
                }
            }
            Ok(())
        }
        _ => {
            let message = store
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "conversion did not finish".to_string());
            anyhow::bail!("Conversion failed: {}", message)
        }
    }
}

/// Prints each transition of the store once.
#[derive(Default)]
struct Progress {
    status: SessionStatus,
    attempt: u32,
    announced: usize,
}

impl Progress {
    fn report(&mut self, store: &ClientStore) {
        if store.status != self.status || store.attempt != self.attempt {
            match store.status {
                SessionStatus::Phase1 => eprintln!("{} analyzing source", style("[1/4]").cyan()),
                SessionStatus::Phase2 => eprintln!("{} planning contracts", style("[2/4]").cyan()),
                SessionStatus::Phase3 => eprintln!(
                    "{} generating {} contract(s)",
                    style("[3/4]").cyan(),
                    store.pending_specs.len().max(1)
                ),
                SessionStatus::Phase4 => eprintln!(
                    "{} repair attempt {} ({} pending)",
                    style("[4/4]").cyan(),
                    store.attempt,
                    store.pending_contracts().len()
                ),
                SessionStatus::Complete => eprintln!(
                    "{} {} contract(s) in {} attempt(s), {} tokens",
                    style("done").green().bold(),
                    store.contracts.len(),
                    store.attempt,
                    store.usage.total()
                ),
                SessionStatus::Error => {
                    if let Some(error) = &store.error {
                        eprintln!("{} {}", style("error").red().bold(), error.message);
                    }
                    if !store.contracts.is_empty() {
                        eprintln!(
                            "{} {} contract(s) validated before the failure",
                            style("note").yellow(),
                            store.contracts.len()
                        );
                    }
                }
                SessionStatus::Idle => {}
            }
            self.status = store.status;
            self.attempt = store.attempt;
        }

        for contract in store.contracts.iter().skip(self.announced) {
            eprintln!("  {} {}", style("✓").green(), contract.name);
        }
        self.announced = store.contracts.len();
    }
}
