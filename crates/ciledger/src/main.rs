//! `ciledger` - shared CI status ledger and AI usage budget gate.
//!
//! Every command resolves one workspace, loads `ciledger.toml` once and
//! hands concrete paths to the library. Command output goes to stdout; logs
//! and refusal reasons go to stderr.

#![forbid(unsafe_code)]

mod budget;
mod context;
mod rotate;
mod status;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ciledger_core::config::{Config, LogFormat, LoggingConfig};
use ciledger_core::logging::init_logging;

use context::AppContext;

/// Concurrent CI status ledger and usage budget enforcer.
#[derive(Parser, Debug)]
#[command(name = "ciledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Workspace root that relative paths resolve against.
    #[arg(long, global = true, env = "CILEDGER_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Config file (defaults to $CILEDGER_CONFIG, then <workspace>/ciledger.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format (pretty or json).
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a raw event to the status ledger.
    AppendStatus(status::AppendArgs),

    /// Append a status update (info, warning, error, success).
    UpdateStatus(status::UpdateArgs),

    /// Record the current pipeline phase.
    SetPhase(status::SetPhaseArgs),

    /// Show the current pipeline phase.
    GetPhase(status::GetPhaseArgs),

    /// Show the most recent ledger activities.
    TailStatus(status::TailArgs),

    /// Archive and truncate the ledger when it is too large or too old.
    RotateStatus(rotate::RotateStatusArgs),

    /// Delete CI artifacts older than the retention period.
    RotateLogs(rotate::RotateLogsArgs),

    /// Usage budget checks, reports and alerts.
    Budget(budget::BudgetArgs),

    /// Print version information.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let config = match Config::load_resolved(cli.config.as_deref(), &workspace) {
        Ok(config) => config,
        Err(err) => {
            init_logging(&LoggingConfig::default(), cli.verbose);
            return Err(err).context("loading configuration");
        }
    };

    let mut logging = config.logging.clone();
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    init_logging(&logging, cli.verbose);
    tracing::debug!(workspace = %workspace.display(), "Resolved workspace");

    let ctx = AppContext::new(workspace, config);
    match cli.command {
        Commands::AppendStatus(args) => status::run_append(&ctx, &args),
        Commands::UpdateStatus(args) => status::run_update(&ctx, &args),
        Commands::SetPhase(args) => status::run_set_phase(&ctx, &args),
        Commands::GetPhase(args) => status::run_get_phase(&ctx, &args),
        Commands::TailStatus(args) => status::run_tail(&ctx, &args),
        Commands::RotateStatus(args) => rotate::run_rotate_status(&ctx, &args),
        Commands::RotateLogs(args) => rotate::run_rotate_logs(&ctx, &args),
        Commands::Budget(args) => budget::run(&ctx, &args),
        Commands::Version => {
            println!("ciledger {}", ciledger_core::VERSION);
            Ok(ExitCode::SUCCESS)
        }
    }
}
