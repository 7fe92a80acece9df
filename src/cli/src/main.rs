//! confstore - Command-line interface for the event-sourced configuration store.
//!
//! Each invocation opens the JSON-lines event log, runs one command through
//! the config service, and exits. Reads rebuild the projection from the log
//! first, so the CLI always runs with the restart-only consistency policy.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use confstore_core::config::{BackendKind, Config};
use confstore_core::prelude::*;
use confstore_core::telemetry::init_logging;

use commands::{history, keys};
use output::OutputFormat;

/// confstore - event-sourced configuration store
#[derive(Parser)]
#[command(
    name = "confstore",
    version,
    about = "confstore - event-sourced configuration store",
    long_about = "Write, read, and audit configuration values kept in an append-only event log.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Event log file
    #[arg(
        long,
        global = true,
        env = "CONFSTORE_LOG_FILE",
        default_value = "confstore-events.jsonl"
    )]
    log_file: PathBuf,

    /// Settings file (TOML, YAML, or JSON)
    #[arg(short, long, global = true, env = "CONFSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit diagnostic logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a value
    Put {
        /// Config key
        key: String,
        /// Value to store
        value: String,
    },

    /// Show the current value of a key
    Get {
        /// Config key
        key: String,
    },

    /// Delete a key
    Delete {
        /// Config key
        key: String,
    },

    /// List every current key
    List,

    /// Show the full event history of a key
    History {
        /// Config key
        key: String,
    },

    /// Show the value a key had at a point in time
    At {
        /// Config key
        key: String,
        /// RFC3339 timestamp, e.g. 2024-03-01T12:00:00Z
        timestamp: String,
    },
}

fn load_settings(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    config.store.backend = BackendKind::File;
    config.store.path = Some(cli.log_file.clone());
    config.projection.policy = ConsistencyPolicy::RestartOnly;
    config.audit.enabled = false;
    if !cli.verbose {
        config.logging.level = "warn".to_string();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_settings(&cli)?;
    init_logging(&config.logging)?;

    let (service, _) = ConfigService::from_config(&config)?;
    let format = cli.output;

    match cli.command {
        Commands::Put { key, value } => keys::put(&service, &key, &value, format).await,
        Commands::Get { key } => keys::get(&service, &key, format).await,
        Commands::Delete { key } => keys::delete(&service, &key, format).await,
        Commands::List => keys::list(&service, format).await,
        Commands::History { key } => history::history(&service, &key, format).await,
        Commands::At { key, timestamp } => history::at(&service, &key, &timestamp, format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        let (message, code) = match e.downcast_ref::<ConfStoreError>() {
            Some(err) => (err.to_string(), exit_code(err.code())),
            None => (format!("{:#}", e), 1),
        };
        output::print_error(&message);
        std::process::exit(code);
    }
}

/// Expected outcomes exit with 2 so scripts can tell them from failures.
fn exit_code(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::NotFound | ErrorCode::AlreadyDeleted => 2,
        _ => 1,
    }
}
