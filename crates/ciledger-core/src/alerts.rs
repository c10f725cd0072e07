//! Spend alerts over a trailing window of days.
//!
//! An exceeded threshold is appended to the budget-state violation trail
//! before the outcome is returned, so the audit record exists even when the
//! caller exits non-zero right after.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::budget::{BudgetStore, Violation};
use crate::error::{Error, Result};
use crate::lock::ScopedLock;
use crate::usage::{UsageAggregator, WindowTotals};

#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    pub threshold: f64,
    pub days: u32,
    pub actual_cost: f64,
    pub exceeded: bool,
    pub usage_breakdown: BTreeMap<String, WindowTotals>,
}

impl AlertOutcome {
    #[must_use]
    pub fn message(&self) -> String {
        if self.exceeded {
            format!(
                "Budget alert: ${:.2} exceeds ${:.2} threshold in last {} days",
                self.actual_cost, self.threshold, self.days
            )
        } else {
            format!(
                "Usage ${:.2} is within ${:.2} threshold",
                self.actual_cost, self.threshold
            )
        }
    }
}

/// Compare total spend over the last `days` against `threshold`, recording
/// a [`Violation`] when it is strictly exceeded.
pub fn evaluate_alert<L: ScopedLock>(
    usage: &UsageAggregator,
    store: &BudgetStore<L>,
    threshold: f64,
    days: u32,
    now: DateTime<Utc>,
) -> Result<AlertOutcome> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(Error::InvalidInput(format!(
            "alert threshold must be a non-negative number, got {threshold}"
        )));
    }
    if days == 0 {
        return Err(Error::InvalidInput("alert window must be at least 1 day".into()));
    }

    let report = usage.aggregate(TimeDelta::days(i64::from(days)), now);
    let actual_cost = report.total_cost();
    let outcome = AlertOutcome {
        threshold,
        days,
        actual_cost,
        exceeded: actual_cost > threshold,
        usage_breakdown: report.services,
    };

    if outcome.exceeded {
        let recorded = store.record_violation(&Violation {
            timestamp: now,
            threshold,
            actual_cost,
            days,
            usage_breakdown: outcome.usage_breakdown.clone(),
        })?;
        tracing::warn!(
            threshold,
            actual_cost,
            days,
            violations = recorded,
            "Budget alert threshold exceeded"
        );
    }
    Ok(outcome)
}
