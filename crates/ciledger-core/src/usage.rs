//! Windowed usage aggregation over JSONL usage-event streams.
//!
//! Each stream line is one call to a paid service:
//!
//! ```text
//! {"timestamp": "2025-01-10T12:00:00Z", "service": "gemini", "cost_usd": 0.12, "tokens_in": 900, "tokens_out": 300}
//! ```
//!
//! Totals are recomputed from the raw streams on every call; windows are
//! never derived from one another.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::timestamp;

/// Trailing one-hour window.
pub const HOUR: TimeDelta = TimeDelta::hours(1);
/// Trailing 24-hour window.
pub const DAY: TimeDelta = TimeDelta::days(1);
/// Trailing 30-day window used for monthly limits.
pub const MONTH: TimeDelta = TimeDelta::days(30);

/// Service key used when a record names neither `service` nor `model`.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Per-service totals over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowTotals {
    pub calls: u64,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl WindowTotals {
    fn apply(&mut self, record: &RawUsage) {
        self.calls = self.calls.saturating_add(1);
        self.cost_usd += record.cost_usd.unwrap_or(0.0);
        self.tokens_in = self.tokens_in.saturating_add(record.tokens_in.unwrap_or(0));
        self.tokens_out = self.tokens_out.saturating_add(record.tokens_out.unwrap_or(0));
    }
}

/// Derived usage of one service. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub service: String,
    #[serde(flatten)]
    pub window: WindowTotals,
}

/// Aggregation result for one window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageReport {
    #[serde(with = "timestamp::lenient")]
    pub since: DateTime<Utc>,
    pub services: BTreeMap<String, WindowTotals>,
    /// Lines that were not valid usage records.
    pub skipped_records: usize,
    pub streams_read: usize,
    pub streams_failed: usize,
}

impl UsageReport {
    /// Totals for `service` (zero when it has no records in the window).
    #[must_use]
    pub fn service(&self, service: &str) -> WindowTotals {
        self.services.get(service).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.services.values().map(|t| t.cost_usd).sum()
    }

    #[must_use]
    pub fn records(&self) -> Vec<UsageRecord> {
        self.services
            .iter()
            .map(|(service, window)| UsageRecord {
                service: service.clone(),
                window: *window,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    tokens_in: Option<u64>,
    #[serde(default)]
    tokens_out: Option<u64>,
}

impl RawUsage {
    fn service_key(&self) -> &str {
        self.service
            .as_deref()
            .or(self.model.as_deref())
            .unwrap_or(UNKNOWN_SERVICE)
    }
}

/// Aggregate `streams` over the trailing `window` ending at `now`.
///
/// Malformed lines and records without a parsable timestamp are skipped and
/// counted; unreadable streams are skipped with a warning.
pub fn aggregate(streams: &[PathBuf], window: TimeDelta, now: DateTime<Utc>) -> UsageReport {
    let mut report = UsageReport {
        since: timestamp::window_start(now, window),
        ..Default::default()
    };
    for stream in streams {
        match File::open(stream) {
            Ok(file) => {
                report.streams_read += 1;
                aggregate_reader(&mut report, stream, BufReader::new(file));
            }
            Err(e) => {
                report.streams_failed += 1;
                tracing::warn!(stream = %stream.display(), error = %e, "Skipping unreadable usage stream");
            }
        }
    }
    tracing::debug!(
        since = %report.since,
        services = report.services.len(),
        skipped = report.skipped_records,
        "Aggregated usage"
    );
    report
}

fn aggregate_reader(report: &mut UsageReport, stream: &Path, reader: impl BufRead) {
    for line in reader.split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(stream = %stream.display(), error = %e, "Usage stream read failed");
                report.streams_failed += 1;
                return;
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let Ok(record) = serde_json::from_slice::<RawUsage>(&line) else {
            report.skipped_records += 1;
            continue;
        };
        let Some(ts) = record.timestamp.as_deref().and_then(timestamp::parse_instant) else {
            report.skipped_records += 1;
            continue;
        };
        if ts >= report.since {
            report
                .services
                .entry(record.service_key().to_string())
                .or_default()
                .apply(&record);
        }
    }
}

/// Discovers usage streams in a directory.
#[derive(Debug, Clone)]
pub struct UsageAggregator {
    usage_dir: PathBuf,
}

impl UsageAggregator {
    pub fn new(usage_dir: impl Into<PathBuf>) -> Self {
        Self {
            usage_dir: usage_dir.into(),
        }
    }

    /// `*.jsonl` files in the usage directory, sorted by name.
    #[must_use]
    pub fn streams(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.usage_dir) else {
            return Vec::new();
        };
        let mut streams: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        streams.sort();
        streams
    }

    pub fn aggregate(&self, window: TimeDelta, now: DateTime<Utc>) -> UsageReport {
        aggregate(&self.streams(), window, now)
    }
}
