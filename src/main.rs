use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kiln::config::{CONFIG_FILE_NAME, KilnConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Streaming Solidity-to-Compact conversion with bounded repair")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the conversion server
    Serve {
        /// Port to serve on (overrides kiln.toml and KILN_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides kiln.toml and KILN_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Use built-in echo oracles instead of the Claude CLI and compiler
        #[arg(long)]
        offline: bool,

        /// Enable dev mode (CORS permissive for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Stream a conversion from a running server and print the result
    Convert {
        /// Solidity source file
        file: PathBuf,

        /// Server base URL (defaults to the configured bind address)
        #[arg(long, env = "KILN_SERVER")]
        server: Option<String>,

        /// Print the final result as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect recorded sessions
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default kiln.toml
    Init,
}

#[derive(Subcommand, Clone)]
pub enum AuditCommands {
    /// Print the audit trail of one session
    Show { session_id: String },
    /// List sessions with an audit trail, newest first
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = KilnConfig::resolve(&cli.config)?;
    let _log_guard = kiln::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            offline,
            dev,
        } => {
            cmd::cmd_serve(config, port, host, offline, dev).await?;
        }
        Commands::Convert { file, server, json } => {
            cmd::cmd_convert(&config, &file, server, json).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
        Commands::Audit { command } => cmd::cmd_audit(&config, &command)?,
    }

    Ok(())
}
