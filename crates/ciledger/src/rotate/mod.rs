//! `ciledger rotate-status` and `ciledger rotate-logs`.

use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::Args;

use ciledger_core::cleanup::{self, CleanupPlan};
use ciledger_core::rotation::{RotationOutcome, RotationPolicy};

use crate::context::AppContext;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Arguments for `ciledger rotate-status`.
#[derive(Args, Debug)]
pub struct RotateStatusArgs {
    /// Rotate when the oldest entry is older than this many days.
    #[arg(long)]
    pub max_age_days: Option<u32>,

    /// Rotate when the ledger file exceeds this size in MB.
    #[arg(long)]
    pub max_size_mb: Option<f64>,

    /// Report what would happen without writing anything.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Arguments for `ciledger rotate-logs`.
#[derive(Args, Debug)]
pub struct RotateLogsArgs {
    /// Delete files last modified more than this many days ago.
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// List eligible files without deleting them.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

fn policy(ctx: &AppContext, args: &RotateStatusArgs) -> Result<RotationPolicy> {
    let mut policy = RotationPolicy::from_config(&ctx.config.rotation, &ctx.layout.archive_dir);
    if let Some(days) = args.max_age_days {
        policy.max_age = TimeDelta::days(i64::from(days));
    }
    if let Some(mb) = args.max_size_mb {
        if !mb.is_finite() || mb <= 0.0 {
            bail!("--max-size-mb must be a positive number, got {mb}");
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes = (mb * BYTES_PER_MB) as u64;
        policy.max_size_bytes = bytes.max(1);
    }
    Ok(policy)
}

pub fn run_rotate_status(ctx: &AppContext, args: &RotateStatusArgs) -> Result<ExitCode> {
    let policy = policy(ctx, args)?;
    let outcome = policy
        .rotate(&ctx.ledger(), Utc::now(), args.dry_run)
        .context("rotating status ledger")?;

    match outcome {
        RotationOutcome::NotNeeded { meta } => {
            println!(
                "No rotation needed ({} entries, {:.2}MB)",
                meta.entries,
                meta.size_bytes as f64 / BYTES_PER_MB
            );
        }
        RotationOutcome::DryRun {
            reasons,
            would_remove,
        } => {
            for reason in &reasons {
                println!("Rotation needed: {reason}");
            }
            println!("Dry run: would archive the ledger and remove {would_remove} events");
        }
        RotationOutcome::Rotated {
            reasons,
            archive,
            removed,
            retained,
        } => {
            for reason in &reasons {
                println!("Rotation needed: {reason}");
            }
            println!("Archived to {}", archive.display());
            println!("Removed {removed} events, kept {retained}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn run_rotate_logs(ctx: &AppContext, args: &RotateLogsArgs) -> Result<ExitCode> {
    let retention_days = args
        .retention_days
        .unwrap_or(ctx.config.cleanup.retention_days);
    let dirs = &ctx.layout.cleanup_dirs;
    let now = SystemTime::now();
    let plan = if args.dry_run {
        cleanup::cleanup_preview(dirs, retention_days, now)
    } else {
        cleanup::cleanup_apply(dirs, retention_days, now)
    }
    .context("cleaning up CI artifacts")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_plan(plan: &CleanupPlan) {
    let verb = if plan.dry_run { "Would delete" } else { "Deleted" };
    for dir in &plan.directories {
        let count = if plan.dry_run {
            dir.eligible_files
        } else {
            dir.deleted_files
        };
        println!(
            "{}: {verb} {count} files ({:.2}MB)",
            dir.directory.display(),
            dir.eligible_bytes as f64 / BYTES_PER_MB
        );
        if plan.dry_run {
            for file in &dir.files {
                println!("  {}", file.path.display());
            }
        }
    }
    let total = if plan.dry_run {
        plan.total_eligible
    } else {
        plan.total_deleted
    };
    println!(
        "{verb} {total} files older than {} days ({:.2}MB)",
        plan.retention_days,
        plan.total_bytes as f64 / BYTES_PER_MB
    );
}
