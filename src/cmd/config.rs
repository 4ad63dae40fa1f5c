//! Configuration view and validation commands (`kiln config`).

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use kiln::config::KilnConfig;

pub fn cmd_config(config_path: &Path, effective: &KilnConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!("Effective values (file, then environment):");
            println!();
            let rendered =
                toml::to_string_pretty(effective).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = effective.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            KilnConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, max_sessions, session_timeout_secs");
            println!("  - [pipeline] max_attempts");
            println!("  - [oracle] claude_cmd, model and [validator] command, args");
            println!();
        }
    }

    Ok(())
}
