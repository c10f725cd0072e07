//! Usage budget enforcement.
//!
//! The enforcer gates calls to paid services against per-service limits
//! from the pricing config. Usage is observed from two sources:
//!
//! - the raw usage streams, aggregated over rolling windows;
//! - the enforcer's own [`BudgetState`], which counts requests admitted
//!   through it per UTC day and month.
//!
//! Daily and monthly figures take the larger of the two, so a request
//! recorded here counts toward those limits before any stream mentions it
//! and is never counted twice once it does. Hourly request counts come from
//! the streams alone.
//!
//! Denials are [`Decision`]s, not errors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::lock::{FileLockManager, ScopedLock};
use crate::persist::{self, Commit, LoadStatus};
use crate::pricing::{CostThresholds, PricingConfig, ServiceLimits, ThresholdLevel};
use crate::timestamp;
use crate::usage::{self, UsageAggregator, WindowTotals};

/// Lock resource guarding the budget-state document.
pub const BUDGET_LOCK: &str = "budget-state";

const LAST_REQUEST_PREFIX: &str = "last_request_";

/// Requests and spend within one day or month bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastReset {
    #[serde(default, with = "crate::timestamp::lenient_opt")]
    pub daily: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::lenient_opt")]
    pub monthly: Option<DateTime<Utc>>,
}

/// A recorded alert threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(with = "crate::timestamp::lenient")]
    pub timestamp: DateTime<Utc>,
    pub threshold: f64,
    pub actual_cost: f64,
    pub days: u32,
    #[serde(default)]
    pub usage_breakdown: BTreeMap<String, WindowTotals>,
}

/// Persisted enforcer state (`.claude/budget-state.json`).
///
/// `last_request_<service>` timestamps live as top-level keys next to the
/// known fields, inside `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// `service -> YYYY-MM-DD -> bucket`
    #[serde(default)]
    pub daily_usage: BTreeMap<String, BTreeMap<String, UsageBucket>>,
    /// `service -> YYYY-MM -> bucket`
    #[serde(default)]
    pub monthly_usage: BTreeMap<String, BTreeMap<String, UsageBucket>>,
    #[serde(default)]
    pub last_reset: LastReset,
    /// Append-only; kept as raw values so entries written by older tools survive.
    #[serde(default)]
    pub violations: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BudgetState {
    #[must_use]
    pub fn last_request(&self, service: &str) -> Option<DateTime<Utc>> {
        self.extra
            .get(&last_request_key(service))
            .and_then(Value::as_str)
            .and_then(timestamp::parse_instant)
    }

    /// All recorded last-request instants, by service.
    #[must_use]
    pub fn last_requests(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.extra
            .iter()
            .filter_map(|(key, value)| {
                let service = key.strip_prefix(LAST_REQUEST_PREFIX)?;
                let ts = timestamp::parse_instant(value.as_str()?)?;
                Some((service.to_string(), ts))
            })
            .collect()
    }

    #[must_use]
    pub fn day_bucket(&self, service: &str, now: DateTime<Utc>) -> UsageBucket {
        bucket(&self.daily_usage, service, &timestamp::day_key(now))
    }

    #[must_use]
    pub fn month_bucket(&self, service: &str, now: DateTime<Utc>) -> UsageBucket {
        bucket(&self.monthly_usage, service, &timestamp::month_key(now))
    }

    /// Count one request of `cost_usd` at `now`.
    pub fn record(&mut self, service: &str, cost_usd: f64, now: DateTime<Utc>) -> UsageBucket {
        self.extra.insert(
            last_request_key(service),
            Value::String(timestamp::format_instant(now)),
        );
        let month = self
            .monthly_usage
            .entry(service.to_string())
            .or_default()
            .entry(timestamp::month_key(now))
            .or_default();
        month.requests += 1;
        month.cost_usd += cost_usd;

        let day = self
            .daily_usage
            .entry(service.to_string())
            .or_default()
            .entry(timestamp::day_key(now))
            .or_default();
        day.requests += 1;
        day.cost_usd += cost_usd;
        *day
    }

    /// Forget everything tracked for `service`. Returns whether anything was removed.
    pub fn reset_service(&mut self, service: &str) -> bool {
        let a = self.extra.remove(&last_request_key(service)).is_some();
        let b = self.daily_usage.remove(service).is_some();
        let c = self.monthly_usage.remove(service).is_some();
        a || b || c
    }

    /// A fresh state with both reset stamps set to `now`.
    #[must_use]
    pub fn reset_all(now: DateTime<Utc>) -> Self {
        Self {
            last_reset: LastReset {
                daily: Some(now),
                monthly: Some(now),
            },
            ..Self::default()
        }
    }

    pub fn push_violation(&mut self, violation: &Violation) -> Result<()> {
        self.violations.push(serde_json::to_value(violation)?);
        Ok(())
    }

    /// Violations that parse in the current shape.
    #[must_use]
    pub fn parsed_violations(&self) -> Vec<Violation> {
        self.violations
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }
}

fn last_request_key(service: &str) -> String {
    format!("{LAST_REQUEST_PREFIX}{service}")
}

fn bucket(
    usage: &BTreeMap<String, BTreeMap<String, UsageBucket>>,
    service: &str,
    key: &str,
) -> UsageBucket {
    usage
        .get(service)
        .and_then(|by_key| by_key.get(key))
        .copied()
        .unwrap_or_default()
}

fn validate_service(service: &str) -> Result<()> {
    if service.trim().is_empty() {
        return Err(Error::InvalidInput("service name must not be empty".into()));
    }
    Ok(())
}

fn validate_cost(cost_usd: f64) -> Result<()> {
    if !cost_usd.is_finite() || cost_usd < 0.0 {
        return Err(Error::InvalidInput(format!(
            "cost must be a non-negative number, got {cost_usd}"
        )));
    }
    Ok(())
}

/// Budget-state persistence under the `budget-state` lock.
pub struct BudgetStore<L: ScopedLock = FileLockManager> {
    path: PathBuf,
    locks: L,
    lock_timeout: Duration,
}

impl<L: ScopedLock> BudgetStore<L> {
    pub fn new(path: impl Into<PathBuf>, locks: L, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            locks,
            lock_timeout,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock-free read of the last published state.
    pub fn load(&self) -> Result<BudgetState> {
        let loaded = persist::load_json_or_default::<BudgetState>(&self.path)?;
        if let LoadStatus::Corrupt { reason } = &loaded.status {
            tracing::warn!(path = %self.path.display(), %reason, "Budget state is corrupt; using defaults");
        }
        Ok(loaded.value)
    }

    /// Record one request. The only mutator of usage totals.
    pub fn record(&self, service: &str, cost_usd: f64, now: DateTime<Utc>) -> Result<UsageBucket> {
        validate_service(service)?;
        validate_cost(cost_usd)?;
        let day = self.update(|state| Ok((state.record(service, cost_usd, now), Commit::Publish)))?;
        tracing::info!(service, cost_usd, day_requests = day.requests, "Recorded request");
        Ok(day)
    }

    /// Reset one service, or everything when `service` is `None`.
    pub fn reset(&self, service: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let changed = self.update(|state| match service {
            Some(service) => {
                let removed = state.reset_service(service);
                Ok((removed, Commit::Publish))
            }
            None => {
                *state = BudgetState::reset_all(now);
                Ok((true, Commit::Publish))
            }
        })?;
        tracing::info!(service = service.unwrap_or("*"), changed, "Reset budget state");
        Ok(changed)
    }

    /// Append a violation. Returns the number of violations on record.
    pub fn record_violation(&self, violation: &Violation) -> Result<usize> {
        self.update(|state| {
            state.push_violation(violation)?;
            Ok((state.violations.len(), Commit::Publish))
        })
    }

    pub(crate) fn update<R>(
        &self,
        update: impl FnOnce(&mut BudgetState) -> Result<(R, Commit)>,
    ) -> Result<R> {
        persist::update_locked(&self.locks, BUDGET_LOCK, self.lock_timeout, &self.path, |state, _| {
            update(state)
        })
    }
}

/// Which request-count window a rate limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Hour,
    Day,
}

/// Which spend a cost limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostScope {
    Daily,
    Monthly,
    /// Today's spend plus the estimated cost of the pending call.
    Projected { estimated_usd: f64 },
}

/// Why a call was denied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited {
        window: RateWindow,
        observed: u64,
        limit: u64,
    },
    CostLimited {
        scope: CostScope,
        observed_usd: f64,
        limit_usd: f64,
    },
    CooldownActive {
        remaining_minutes: u64,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited {
                window,
                observed,
                limit,
            } => {
                let label = match window {
                    RateWindow::Hour => "Hourly",
                    RateWindow::Day => "Daily",
                };
                write!(f, "{label} request limit exceeded: {observed}/{limit}")
            }
            Self::CostLimited {
                scope: CostScope::Projected { estimated_usd },
                observed_usd,
                limit_usd,
            } => write!(
                f,
                "Estimated cost ${estimated_usd:.2} would exceed daily limit: \
                 ${observed_usd:.2} + ${estimated_usd:.2} > ${limit_usd:.2}"
            ),
            Self::CostLimited {
                scope,
                observed_usd,
                limit_usd,
            } => {
                let label = if matches!(scope, CostScope::Monthly) {
                    "Monthly"
                } else {
                    "Daily"
                };
                write!(
                    f,
                    "{label} cost limit exceeded: ${observed_usd:.2}/${limit_usd:.2}"
                )
            }
            Self::CooldownActive { remaining_minutes } => {
                write!(f, "In cooldown: wait {remaining_minutes} minutes")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Blocked(BlockReason),
}

/// Usage of one service as seen by a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub hourly_calls: u64,
    pub daily_calls: u64,
    pub daily_cost_usd: f64,
    pub monthly_cost_usd: f64,
    #[serde(with = "crate::timestamp::lenient_opt")]
    pub last_request: Option<DateTime<Utc>>,
}

/// Every limit `usage` violates, in check order.
#[must_use]
pub fn evaluate(
    limits: &ServiceLimits,
    usage: &UsageSnapshot,
    estimated_cost: f64,
    now: DateTime<Utc>,
) -> Vec<BlockReason> {
    let mut violations = Vec::new();

    if let Some(limit) = limits.max_requests_per_hour {
        if usage.hourly_calls >= limit {
            violations.push(BlockReason::RateLimited {
                window: RateWindow::Hour,
                observed: usage.hourly_calls,
                limit,
            });
        }
    }
    if let Some(limit) = limits.max_requests_per_day {
        if usage.daily_calls >= limit {
            violations.push(BlockReason::RateLimited {
                window: RateWindow::Day,
                observed: usage.daily_calls,
                limit,
            });
        }
    }
    if let Some(limit) = limits.max_cost_per_day {
        if usage.daily_cost_usd >= limit {
            violations.push(BlockReason::CostLimited {
                scope: CostScope::Daily,
                observed_usd: usage.daily_cost_usd,
                limit_usd: limit,
            });
        }
    }
    if let Some(limit) = limits.max_cost_per_month {
        if usage.monthly_cost_usd >= limit {
            violations.push(BlockReason::CostLimited {
                scope: CostScope::Monthly,
                observed_usd: usage.monthly_cost_usd,
                limit_usd: limit,
            });
        }
    }
    if let Some(limit) = limits.max_cost_per_day {
        if estimated_cost > 0.0 && usage.daily_cost_usd + estimated_cost > limit {
            violations.push(BlockReason::CostLimited {
                scope: CostScope::Projected {
                    estimated_usd: estimated_cost,
                },
                observed_usd: usage.daily_cost_usd,
                limit_usd: limit,
            });
        }
    }
    if let (Some(minutes), Some(last)) = (limits.cooldown_minutes, usage.last_request) {
        if let Some(remaining_minutes) = cooldown_remaining(minutes, last, now) {
            violations.push(BlockReason::CooldownActive { remaining_minutes });
        }
    }
    violations
}

/// Whole minutes (rounded up) until the cooldown after `last` ends, or
/// `None` when it already has.
fn cooldown_remaining(minutes: f64, last: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    if minutes.is_nan() || minutes <= 0.0 {
        return None;
    }
    let cooldown = TimeDelta::milliseconds((minutes * 60_000.0).round() as i64);
    let end = last
        .checked_add_signed(cooldown)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if now >= end {
        return None;
    }
    let remaining_ms = (end - now).num_milliseconds();
    Some(((remaining_ms + 59_999) / 60_000) as u64)
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub service: String,
    pub decision: Decision,
    pub violations: Vec<BlockReason>,
    pub usage: UsageSnapshot,
    pub limits: ServiceLimits,
    pub estimated_cost: f64,
    /// Whether the request was recorded as part of this evaluation.
    pub recorded: bool,
}

impl Evaluation {
    #[must_use]
    pub fn allowed(&self) -> bool {
        matches!(self.decision, Decision::Allowed)
    }

    /// Human-readable description of every violated limit.
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Per-service line of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub totals: WindowTotals,
    pub limits: ServiceLimits,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub days: u32,
    pub services: Vec<ServiceStatus>,
    pub total_cost_usd: f64,
    pub thresholds: CostThresholds,
    pub level: ThresholdLevel,
    pub skipped_records: usize,
}

/// Gates service calls against configured limits.
pub struct BudgetEnforcer<L: ScopedLock = FileLockManager> {
    pricing: PricingConfig,
    usage: UsageAggregator,
    store: BudgetStore<L>,
}

impl<L: ScopedLock> BudgetEnforcer<L> {
    pub fn new(pricing: PricingConfig, usage: UsageAggregator, store: BudgetStore<L>) -> Self {
        Self {
            pricing,
            usage,
            store,
        }
    }

    #[must_use]
    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    #[must_use]
    pub fn usage(&self) -> &UsageAggregator {
        &self.usage
    }

    #[must_use]
    pub fn store(&self) -> &BudgetStore<L> {
        &self.store
    }

    /// Observed usage of `service` from streams and `state`.
    #[must_use]
    pub fn snapshot(&self, service: &str, state: &BudgetState, now: DateTime<Utc>) -> UsageSnapshot {
        let hourly = self.usage.aggregate(usage::HOUR, now).service(service);
        let daily = self.usage.aggregate(usage::DAY, now).service(service);
        let monthly = self.usage.aggregate(usage::MONTH, now).service(service);
        let day_bucket = state.day_bucket(service, now);
        let month_bucket = state.month_bucket(service, now);

        UsageSnapshot {
            hourly_calls: hourly.calls,
            daily_calls: daily.calls.max(day_bucket.requests),
            daily_cost_usd: daily.cost_usd.max(day_bucket.cost_usd),
            monthly_cost_usd: monthly.cost_usd.max(month_bucket.cost_usd),
            last_request: state.last_request(service),
        }
    }

    /// Decide whether a call of `estimated_cost` to `service` may proceed.
    /// Read-only.
    pub fn check(&self, service: &str, estimated_cost: f64, now: DateTime<Utc>) -> Result<Evaluation> {
        validate_service(service)?;
        validate_cost(estimated_cost)?;
        let state = self.store.load()?;
        let evaluation = self.evaluate_with(service, estimated_cost, &state, now);
        log_evaluation(&evaluation);
        Ok(evaluation)
    }

    /// Check and, when allowed and `record` is set, record the call in the
    /// same budget-state critical section.
    pub fn admit(
        &self,
        service: &str,
        estimated_cost: f64,
        record: bool,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        validate_service(service)?;
        validate_cost(estimated_cost)?;
        let evaluation = self.store.update(|state| {
            let mut evaluation = self.evaluate_with(service, estimated_cost, state, now);
            if evaluation.allowed() && record {
                state.record(service, estimated_cost, now);
                evaluation.recorded = true;
                Ok((evaluation, Commit::Publish))
            } else {
                Ok((evaluation, Commit::Discard))
            }
        })?;
        log_evaluation(&evaluation);
        Ok(evaluation)
    }

    /// Usage summary over the trailing `days`, optionally for one service.
    #[must_use]
    pub fn status(&self, days: u32, service: Option<&str>, now: DateTime<Utc>) -> BudgetStatus {
        let report = self
            .usage
            .aggregate(TimeDelta::days(i64::from(days)), now);
        let services: Vec<ServiceStatus> = report
            .services
            .iter()
            .filter(|(name, _)| service.is_none_or(|s| s == name.as_str()))
            .map(|(name, totals)| ServiceStatus {
                service: name.clone(),
                totals: *totals,
                limits: self.pricing.limits_for(name),
            })
            .collect();
        let total_cost_usd = services.iter().map(|s| s.totals.cost_usd).sum();
        let thresholds = self.pricing.thresholds.cost_per_day;
        BudgetStatus {
            days,
            services,
            total_cost_usd,
            level: thresholds.classify(total_cost_usd),
            thresholds,
            skipped_records: report.skipped_records,
        }
    }

    fn evaluate_with(
        &self,
        service: &str,
        estimated_cost: f64,
        state: &BudgetState,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let limits = self.pricing.limits_for(service);
        let usage = self.snapshot(service, state, now);
        let violations = evaluate(&limits, &usage, estimated_cost, now);
        let decision = violations
            .first()
            .cloned()
            .map_or(Decision::Allowed, Decision::Blocked);
        Evaluation {
            service: service.to_string(),
            decision,
            violations,
            usage,
            limits,
            estimated_cost,
            recorded: false,
        }
    }
}

fn log_evaluation(evaluation: &Evaluation) {
    match &evaluation.decision {
        Decision::Allowed => tracing::debug!(
            service = %evaluation.service,
            estimated_cost = evaluation.estimated_cost,
            recorded = evaluation.recorded,
            "Budget check allowed"
        ),
        Decision::Blocked(reason) => tracing::info!(
            service = %evaluation.service,
            reason = %reason,
            "Budget check blocked"
        ),
    }
}
