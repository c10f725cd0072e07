//! Ledger commands: `append-status`, `update-status`, `set-phase`,
//! `get-phase` and `tail-status`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde_json::Value;

use ciledger_core::ledger::{Activity, Event, Phase, StatusLevel};
use ciledger_core::timestamp;

use crate::context::AppContext;

/// Arguments for `ciledger append-status`.
#[derive(Args, Debug)]
pub struct AppendArgs {
    /// Event type (e.g. "build_started").
    pub event_type: String,

    /// Event details as a JSON document.
    pub details: String,
}

/// Arguments for `ciledger update-status`.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Status message.
    pub message: String,

    /// Status level: info, warning, error or success.
    #[arg(long = "status-type", short = 't', default_value = "info")]
    pub level: StatusLevel,

    /// Phase id to tag the entry with (defaults to the current phase).
    #[arg(long)]
    pub phase: Option<String>,

    /// Extra metadata as a JSON document.
    #[arg(long)]
    pub metadata: Option<String>,
}

/// Arguments for `ciledger set-phase`.
#[derive(Args, Debug)]
pub struct SetPhaseArgs {
    /// Phase id (e.g. "build").
    pub id: String,

    /// Human-readable phase name.
    pub name: String,

    /// Phase status.
    #[arg(long, default_value = "in_progress")]
    pub status: String,
}

/// Arguments for `ciledger get-phase`.
#[derive(Args, Debug)]
pub struct GetPhaseArgs {
    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Arguments for `ciledger tail-status`.
#[derive(Args, Debug)]
pub struct TailArgs {
    /// Number of activities to show.
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Output JSON instead of human-readable format.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn run_append(ctx: &AppContext, args: &AppendArgs) -> Result<ExitCode> {
    let details: Value = serde_json::from_str(&args.details)
        .with_context(|| format!("event details are not valid JSON: {}", args.details))?;
    let event = Event::new(&args.event_type, details, Utc::now())?;
    let receipt = ctx.ledger().append(event).context("appending status event")?;
    println!(
        "Appended {} event ({} entries)",
        args.event_type, receipt.entries
    );
    Ok(ExitCode::SUCCESS)
}

pub fn run_update(ctx: &AppContext, args: &UpdateArgs) -> Result<ExitCode> {
    let store = ctx.ledger();
    let phase = match &args.phase {
        Some(phase) => phase.clone(),
        None => store
            .read()?
            .phase_id()
            .unwrap_or_else(|| "unknown".to_string()),
    };
    let metadata = args.metadata.as_deref().and_then(parse_metadata);

    let event = Event::status(args.level, &args.message, &phase, metadata, Utc::now());
    store.append(event).context("appending status update")?;
    println!("[{}] {}", args.level, args.message);
    Ok(ExitCode::SUCCESS)
}

/// Metadata is optional decoration; a malformed document is dropped.
fn parse_metadata(raw: &str) -> Option<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring metadata that is not valid JSON");
            None
        }
    }
}

pub fn run_set_phase(ctx: &AppContext, args: &SetPhaseArgs) -> Result<ExitCode> {
    let phase = Phase::new(&args.id, &args.name, &args.status, Utc::now());
    ctx.ledger().set_phase(phase).context("setting pipeline phase")?;
    println!("Phase set: {} ({})", args.name, args.id);
    Ok(ExitCode::SUCCESS)
}

pub fn run_get_phase(ctx: &AppContext, args: &GetPhaseArgs) -> Result<ExitCode> {
    let phase = ctx.ledger().current_phase()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&phase)?);
        return Ok(ExitCode::SUCCESS);
    }

    let (id, name, status) = phase.map_or_else(
        || ("unknown".to_string(), "Unknown".to_string(), "unknown".to_string()),
        |p| (p.id, p.name, p.status),
    );
    println!("Phase ID: {id}");
    println!("Phase Name: {name}");
    println!("Status: {status}");
    Ok(ExitCode::SUCCESS)
}

pub fn run_tail(ctx: &AppContext, args: &TailArgs) -> Result<ExitCode> {
    let doc = ctx.ledger().read()?;
    let recent = doc.recent(args.limit);

    if args.json {
        println!("{}", serde_json::to_string_pretty(recent)?);
        return Ok(ExitCode::SUCCESS);
    }

    if recent.is_empty() {
        println!("No activities recorded");
        return Ok(ExitCode::SUCCESS);
    }
    for activity in recent {
        println!("{}", format_activity(activity));
    }
    Ok(ExitCode::SUCCESS)
}

fn format_activity(activity: &Activity) -> String {
    match activity {
        Activity::Event(event) => {
            let summary = event
                .details
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| event.details.to_string(), str::to_string);
            format!(
                "{} [{}] {}",
                timestamp::format_instant(event.timestamp),
                event.event_type,
                summary
            )
        }
        Activity::Unrecognized(raw) => format!("? {raw}"),
    }
}
