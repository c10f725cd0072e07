//! Size- and age-triggered ledger rotation.
//!
//! Rotation archives the canonical ledger bytes, then rewrites the ledger
//! with only recent activities. Both steps happen inside one ledger-lock
//! critical section, so appends either land before the archive (and are in
//! it) or after the truncation.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::RotationConfig;
use crate::error::{Error, Result};
use crate::ledger::{Activity, LedgerDocument, LedgerMeta, LedgerStore};
use crate::lock::ScopedLock;
use crate::persist::{self, Commit};
use crate::timestamp;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why a rotation is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum RotationReason {
    Size { size_bytes: u64, limit_bytes: u64 },
    Age { age_days: i64, max_age_days: i64 },
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size {
                size_bytes,
                limit_bytes,
            } => write!(
                f,
                "Size {:.2}MB exceeds {:.2}MB limit",
                *size_bytes as f64 / BYTES_PER_MB,
                *limit_bytes as f64 / BYTES_PER_MB
            ),
            Self::Age {
                age_days,
                max_age_days,
            } => write!(f, "Oldest entry is {age_days} days old (max: {max_age_days})"),
        }
    }
}

/// Result of evaluating the triggers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationCheck {
    pub reasons: Vec<RotationReason>,
}

impl RotationCheck {
    #[must_use]
    pub fn needed(&self) -> bool {
        !self.reasons.is_empty()
    }

    fn size_triggered(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, RotationReason::Size { .. }))
    }
}

/// What a call to [`RotationPolicy::rotate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    NotNeeded {
        meta: LedgerMeta,
    },
    DryRun {
        reasons: Vec<RotationReason>,
        would_remove: usize,
    },
    Rotated {
        reasons: Vec<RotationReason>,
        archive: PathBuf,
        removed: usize,
        retained: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub max_size_bytes: u64,
    pub max_age: TimeDelta,
    pub archive_dir: PathBuf,
}

impl RotationPolicy {
    #[must_use]
    pub fn from_config(config: &RotationConfig, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes,
            max_age: config.max_age(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Evaluate both triggers against `meta`.
    #[must_use]
    pub fn should_rotate(&self, meta: &LedgerMeta, now: DateTime<Utc>) -> RotationCheck {
        let mut reasons = Vec::new();
        if meta.size_bytes > self.max_size_bytes {
            reasons.push(RotationReason::Size {
                size_bytes: meta.size_bytes,
                limit_bytes: self.max_size_bytes,
            });
        }
        if let Some(oldest) = meta.oldest {
            let age = now - oldest;
            if age > self.max_age {
                reasons.push(RotationReason::Age {
                    age_days: age.num_days(),
                    max_age_days: self.max_age.num_days(),
                });
            }
        }
        RotationCheck { reasons }
    }

    /// Archive and truncate the ledger if a trigger fires.
    ///
    /// The triggers are re-evaluated under the lock, so a rotation that
    /// raced with another one reports `NotNeeded` instead of archiving twice.
    pub fn rotate<L: ScopedLock>(
        &self,
        store: &LedgerStore<L>,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<RotationOutcome> {
        let ledger_path = store.path().to_path_buf();
        let outcome = store.locked_update(|doc, size_bytes| {
            let meta = LedgerMeta::of(doc, size_bytes);
            let check = self.should_rotate(&meta, now);
            if !check.needed() {
                return Ok((RotationOutcome::NotNeeded { meta }, Commit::Discard));
            }

            let original = doc.activities.len();
            let mut pruned = doc.clone();
            self.prune(&mut pruned, now, check.size_triggered())?;
            let removed = original - pruned.activities.len();

            if dry_run {
                return Ok((
                    RotationOutcome::DryRun {
                        reasons: check.reasons,
                        would_remove: removed,
                    },
                    Commit::Discard,
                ));
            }

            let bytes = fs::read(&ledger_path).map_err(|e| Error::io(&ledger_path, e))?;
            let archive = persist::unique_path(
                &self.archive_dir,
                &format!("pipeline-log-{}", timestamp::file_stamp(now)),
                ".json",
            );
            persist::write_atomic(&archive, &bytes)?;
            tracing::info!(archive = %archive.display(), bytes = bytes.len(), "Archived ledger");

            *doc = pruned;
            Ok((
                RotationOutcome::Rotated {
                    reasons: check.reasons,
                    archive,
                    removed,
                    retained: doc.activities.len(),
                },
                Commit::Publish,
            ))
        })?;

        if let RotationOutcome::Rotated {
            removed, retained, ..
        } = &outcome
        {
            tracing::info!(removed, retained, "Rotated ledger");
        }
        Ok(outcome)
    }

    /// Keep activities newer than the age cutoff; when the size trigger
    /// fired, also evict the oldest until the document fits.
    fn prune(&self, doc: &mut LedgerDocument, now: DateTime<Utc>, enforce_size: bool) -> Result<()> {
        let cutoff = timestamp::window_start(now, self.max_age);
        doc.activities
            .retain(|a| a.timestamp().is_some_and(|ts| ts > cutoff));

        if enforce_size && encoded_len(doc)? > self.max_size_bytes {
            let evict = self.min_eviction_to_fit(doc)?;
            doc.activities.drain(..evict);
            if encoded_len(doc)? > self.max_size_bytes {
                tracing::warn!(
                    limit_bytes = self.max_size_bytes,
                    "Ledger exceeds size limit even without activities"
                );
            }
        }
        Ok(())
    }

    /// Smallest number of leading activities to drop so the document fits.
    fn min_eviction_to_fit(&self, doc: &LedgerDocument) -> Result<usize> {
        let activities: &[Activity] = &doc.activities;
        let mut candidate = LedgerDocument {
            activities: Vec::new(),
            ..doc.clone()
        };
        let (mut lo, mut hi) = (0usize, activities.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            candidate.activities = activities[mid..].to_vec();
            if encoded_len(&candidate)? <= self.max_size_bytes {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}

/// Size of `doc` as [`persist::write_json_atomic`] would write it.
fn encoded_len(doc: &LedgerDocument) -> Result<u64> {
    Ok(serde_json::to_vec_pretty(doc)?.len() as u64 + 1)
}
