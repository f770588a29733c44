//! wfctl - workflow operator tool
//!
//! - `validate`: check definition files before deploying them
//! - `verify`: recompute an entity's audit chain
//! - `history`: dump an entity's audit chain as JSON
//! - `config`: print the effective engine configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_engine::EngineConfig;

mod commands;

/// Workflow engine operator CLI
#[derive(Parser, Debug)]
#[command(name = "wfctl")]
#[command(about = "Validate workflow definitions and inspect audit chains", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WORKFLOW_CONFIG", global = true)]
    config: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "WORKFLOW_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate definition files
    Validate {
        /// JSON files holding one definition or an array of definitions
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Verify the audit chain of one entity
    Verify {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
    },

    /// Print the audit chain of one entity as JSON
    History {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    match cli.command {
        Command::Validate { files } => {
            let report = commands::validate(&files);
            for line in &report.lines {
                println!("{line}");
            }
            Ok(report.exit_code())
        }
        Command::Verify {
            entity_type,
            entity_id,
        } => commands::verify(&config, &entity_type, &entity_id).await,
        Command::History {
            entity_type,
            entity_id,
        } => commands::history(&config, &entity_type, &entity_id).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr so command output stays machine-readable.
fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
