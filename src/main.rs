use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

use cmd::CrucibleExit;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Drive a code-generation agent until quality gates pass")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline once, or iterate with --loop
    Run {
        /// Iterate: patch the requirements from feedback and run again
        #[arg(long = "loop")]
        looped: bool,

        /// Iteration cap for --loop (overrides crucible.toml)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Coverage threshold in percent (overrides crucible.toml)
        #[arg(long)]
        coverage: Option<f64>,
    },
    /// Show work-item progress and runner state
    Status,
    /// Show the decision log and recorded runs
    Audit {
        /// Only decisions of this kind (enrich, constrain, descope, detail, fix)
        #[arg(long)]
        kind: Option<String>,

        /// Only decisions at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,

        /// Only decisions at or before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<String>,

        /// Only decisions made in this iteration
        #[arg(long)]
        iteration: Option<u32>,
    },
    /// Report a work-item transition
    Feature {
        #[command(subcommand)]
        command: FeatureCommands,
    },
    /// Evaluate and print the quality gates without running
    Gates {
        /// Coverage threshold in percent (overrides crucible.toml)
        #[arg(long)]
        coverage: Option<f64>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum FeatureCommands {
    /// Record a failed try
    Attempt {
        id: String,
        /// Work group (found automatically when the id is unique)
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Mark a work item passed
    Pass {
        id: String,
        #[arg(short, long)]
        group: Option<String>,
        /// What demonstrates the item works
        #[arg(short, long)]
        evidence: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default crucible.toml
    Init,
}

async fn dispatch(cli: Cli) -> Result<CrucibleExit> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Run {
            looped,
            max_iterations,
            coverage,
        } => {
            let args = cmd::run::RunArgs {
                looped,
                max_iterations,
                coverage,
            };
            cmd::cmd_run(project_dir, cli.verbose, args).await
        }
        Commands::Status => cmd::cmd_status(project_dir),
        Commands::Audit {
            kind,
            since,
            until,
            iteration,
        } => {
            let args = cmd::audit::AuditArgs {
                kind,
                since,
                until,
                iteration,
            };
            cmd::cmd_audit(project_dir, args)
        }
        Commands::Feature { command } => cmd::cmd_feature(project_dir, command),
        Commands::Gates { coverage } => cmd::cmd_gates(project_dir, coverage),
        Commands::Config { command } => cmd::cmd_config(project_dir, command),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Only a run writes the JSON log; read-only commands stay out of .crucible/.
    let log_dir = match (&cli.command, &cli.project_dir) {
        (Commands::Run { .. }, Some(dir)) => Some(dir.join(".crucible").join("logs")),
        (Commands::Run { .. }, None) => std::env::current_dir()
            .ok()
            .map(|d| d.join(".crucible").join("logs")),
        _ => None,
    };
    let _guard = crucible::logging::init(cli.verbose, log_dir.as_deref());

    match dispatch(cli).await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            CrucibleExit::Operational.into()
        }
    }
}
