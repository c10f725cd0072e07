//! `ciledger budget` command implementation.
//!
//! `check` gates a pending call, `status` reports spend against the
//! configured thresholds, `reset` clears recorded usage and `alert` records
//! a violation when spend over a trailing window crosses a threshold.
//! Blocked checks and exceeded alerts exit 1.

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use ciledger_core::alerts::evaluate_alert;
use ciledger_core::budget::{BudgetStatus, Evaluation};
use ciledger_core::pricing::ThresholdLevel;

use crate::context::AppContext;

/// Arguments for the `ciledger budget` command.
#[derive(Args, Debug)]
pub struct BudgetArgs {
    #[command(subcommand)]
    pub command: BudgetCommands,
}

#[derive(Subcommand, Debug)]
pub enum BudgetCommands {
    /// Check whether a call to a service is within budget.
    Check(CheckArgs),

    /// Report usage over the last N days.
    Status(StatusArgs),

    /// Clear recorded usage for one service or for all of them.
    Reset(ResetArgs),

    /// Record a violation when spend exceeds a threshold.
    Alert(AlertArgs),
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Service name (e.g. "gemini").
    pub service: String,

    /// Estimated cost of the pending call in USD.
    #[arg(long, default_value_t = 0.0)]
    pub cost: f64,

    /// Record the call when allowed, even at zero cost.
    #[arg(long, default_value_t = false)]
    pub record: bool,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Window length in days.
    #[arg(long, default_value_t = 7)]
    pub days: u32,

    /// Only report this service.
    #[arg(long)]
    pub service: Option<String>,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Reset only this service.
    #[arg(long)]
    pub service: Option<String>,

    /// Required; without it nothing is changed.
    #[arg(long, default_value_t = false)]
    pub confirm: bool,
}

#[derive(Args, Debug)]
pub struct AlertArgs {
    /// Spend threshold in USD.
    #[arg(long, default_value_t = 10.0)]
    pub threshold: f64,

    /// Window length in days.
    #[arg(long, default_value_t = 1)]
    pub days: u32,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Run the budget command.
pub fn run(ctx: &AppContext, args: &BudgetArgs) -> Result<ExitCode> {
    match &args.command {
        BudgetCommands::Check(args) => run_check(ctx, args),
        BudgetCommands::Status(args) => run_status(ctx, args),
        BudgetCommands::Reset(args) => run_reset(ctx, args),
        BudgetCommands::Alert(args) => run_alert(ctx, args),
    }
}

fn run_check(ctx: &AppContext, args: &CheckArgs) -> Result<ExitCode> {
    let enforcer = ctx.enforcer()?;
    let now = Utc::now();
    // A call with a known cost is recorded as soon as it is admitted.
    let record = args.record || args.cost > 0.0;
    let evaluation = if record {
        enforcer.admit(&args.service, args.cost, true, now)
    } else {
        enforcer.check(&args.service, args.cost, now)
    }
    .with_context(|| format!("checking budget for {}", args.service))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
    } else {
        print_evaluation(&evaluation);
    }

    if evaluation.allowed() {
        Ok(ExitCode::SUCCESS)
    } else {
        for reason in evaluation.reasons() {
            eprintln!("Blocked: {reason}");
        }
        Ok(ExitCode::FAILURE)
    }
}

fn print_evaluation(evaluation: &Evaluation) {
    if !evaluation.allowed() {
        return;
    }
    let usage = &evaluation.usage;
    println!(
        "Allowed: {} (estimated ${:.2})",
        evaluation.service, evaluation.estimated_cost
    );
    println!(
        "  Requests: {} this hour, {} today",
        usage.hourly_calls, usage.daily_calls
    );
    println!(
        "  Cost: ${:.2} today, ${:.2} this month",
        usage.daily_cost_usd, usage.monthly_cost_usd
    );
    if evaluation.recorded {
        println!("  Recorded");
    }
}

fn run_status(ctx: &AppContext, args: &StatusArgs) -> Result<ExitCode> {
    let enforcer = ctx.enforcer()?;
    let status = enforcer.status(args.days, args.service.as_deref(), Utc::now());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(status: &BudgetStatus) {
    println!("Usage over the last {} days", status.days);
    if status.services.is_empty() {
        println!("  No usage recorded");
    }
    for line in &status.services {
        let t = &line.totals;
        println!(
            "  {:<16} {:>6} calls  ${:>10.2}  {} in / {} out tokens",
            line.service, t.calls, t.cost_usd, t.tokens_in, t.tokens_out
        );
        for (key, value) in line.limits.max_entries() {
            println!("    {key}: {value}");
        }
    }
    println!("Total: ${:.2}", status.total_cost_usd);
    if status.skipped_records > 0 {
        println!("Skipped {} malformed usage records", status.skipped_records);
    }

    let limit = match status.level {
        ThresholdLevel::Normal => return,
        ThresholdLevel::Warning => status.thresholds.warning,
        ThresholdLevel::Critical => status.thresholds.critical,
    };
    println!(
        "{}: ${:.2} exceeds ${limit:.2} threshold",
        status.level, status.total_cost_usd
    );
}

fn run_reset(ctx: &AppContext, args: &ResetArgs) -> Result<ExitCode> {
    let target = args.service.as_deref().unwrap_or("all services");
    if !args.confirm {
        eprintln!("Refusing to reset budget state for {target} without --confirm");
        return Ok(ExitCode::FAILURE);
    }

    let changed = ctx
        .budget_store()
        .reset(args.service.as_deref(), Utc::now())
        .context("resetting budget state")?;
    if changed {
        println!("Reset budget state for {target}");
    } else {
        println!("No recorded usage for {target}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_alert(ctx: &AppContext, args: &AlertArgs) -> Result<ExitCode> {
    let outcome = evaluate_alert(
        &ctx.usage(),
        &ctx.budget_store(),
        args.threshold,
        args.days,
        Utc::now(),
    )
    .context("evaluating budget alert")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    if outcome.exceeded {
        eprintln!("{}", outcome.message());
        Ok(ExitCode::FAILURE)
    } else {
        if !args.json {
            println!("{}", outcome.message());
        }
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(subcommand)]
        command: BudgetCommands,
    }

    #[test]
    fn check_defaults_to_zero_cost_without_recording() {
        let parsed = Harness::try_parse_from(["budget", "check", "gemini"]).unwrap();
        let BudgetCommands::Check(args) = parsed.command else {
            panic!("expected check");
        };
        assert_eq!(args.cost, 0.0);
        assert!(!args.record);
    }

    #[test]
    fn alert_defaults() {
        let parsed = Harness::try_parse_from(["budget", "alert"]).unwrap();
        let BudgetCommands::Alert(args) = parsed.command else {
            panic!("expected alert");
        };
        assert_eq!(args.threshold, 10.0);
        assert_eq!(args.days, 1);
    }

    #[test]
    fn reset_is_unconfirmed_by_default() {
        let parsed = Harness::try_parse_from(["budget", "reset", "--service", "o3"]).unwrap();
        let BudgetCommands::Reset(args) = parsed.command else {
            panic!("expected reset");
        };
        assert!(!args.confirm);
        assert_eq!(args.service.as_deref(), Some("o3"));
    }
}
