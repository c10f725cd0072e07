//! Append-only CI activity ledger.
//!
//! The ledger is a single JSON document shared by every CI job. Mutations
//! are read-modify-write cycles under the `status` lock and publish the whole
//! document atomically; reads take no lock and always observe the last
//! published document.
//!
//! ```text
//! {
//!   "activities": [{"timestamp": "...Z", "type": "build", "details": {...}}],
//!   "phase_history": [...],
//!   "current_phase": {"id": "...", "name": "...", "status": "...", "started_at": "...Z"}
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::lock::{FileLockManager, ScopedLock};
use crate::persist::{self, Commit, LoadStatus};

/// Lock resource guarding the ledger document.
pub const LEDGER_LOCK: &str = "status";

/// Default retention cap.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// One structured ledger entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "crate::timestamp::lenient")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub details: Value,
    /// Sibling fields written by other tools.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, details: Value, timestamp: DateTime<Utc>) -> Result<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(Error::InvalidInput("event type must not be empty".into()));
        }
        Ok(Self {
            timestamp,
            event_type,
            details,
            extra: Map::new(),
        })
    }

    /// A status update: `type` is the level, details carry the message.
    pub fn status(
        level: StatusLevel,
        message: &str,
        phase: &str,
        metadata: Option<Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut details = Map::new();
        details.insert("message".into(), Value::String(message.to_string()));
        details.insert("phase".into(), Value::String(phase.to_string()));
        if let Some(metadata) = metadata {
            details.insert("metadata".into(), metadata);
        }
        Self {
            timestamp,
            event_type: level.to_string(),
            details: Value::Object(details),
            extra: Map::new(),
        }
    }
}

/// An entry in `activities`. Entries this version cannot interpret are
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Activity {
    Event(Event),
    Unrecognized(Value),
}

impl Activity {
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Event(event) => Some(event.timestamp),
            Self::Unrecognized(value) => value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(crate::timestamp::parse_instant),
        }
    }

    #[must_use]
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Unrecognized(_) => None,
        }
    }
}

impl From<Event> for Activity {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Severity of an `update-status` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

impl FromStr for StatusLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(format!(
                "Unknown status type: {s}. Use info, warning, error or success"
            )),
        }
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// The pipeline phase currently in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(with = "crate::timestamp::lenient")]
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Phase {
    #[must_use]
    pub fn new(id: &str, name: &str, status: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: status.to_string(),
            started_at,
            extra: Map::new(),
        }
    }
}

/// The persisted ledger document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub phase_history: Vec<Value>,
    /// Kept loosely typed so a foreign shape never makes the document unreadable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LedgerDocument {
    /// The current phase, if one is recorded in a recognizable shape.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.current_phase
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Id of the current phase, for tagging status entries.
    #[must_use]
    pub fn phase_id(&self) -> Option<String> {
        self.current_phase
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The last `limit` activities, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> &[Activity] {
        let start = self.activities.len().saturating_sub(limit);
        &self.activities[start..]
    }

    /// Oldest parsable activity timestamp.
    #[must_use]
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.activities.iter().filter_map(Activity::timestamp).min()
    }
}

/// Drop the oldest items until at most `cap` remain. Returns how many were evicted.
pub fn apply_retention<T>(items: &mut Vec<T>, cap: usize) -> usize {
    let excess = items.len().saturating_sub(cap);
    if excess > 0 {
        items.drain(..excess);
    }
    excess
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppendReceipt {
    /// Activities in the ledger after the append.
    pub entries: usize,
    /// Activities evicted by the retention cap.
    pub evicted: usize,
}

/// On-disk facts used by the rotation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMeta {
    pub size_bytes: u64,
    pub entries: usize,
    pub oldest: Option<DateTime<Utc>>,
}

impl LedgerMeta {
    #[must_use]
    pub fn of(doc: &LedgerDocument, size_bytes: u64) -> Self {
        Self {
            size_bytes,
            entries: doc.activities.len(),
            oldest: doc.oldest_timestamp(),
        }
    }
}

/// Ledger persistence bound to one document path and one lock domain.
pub struct LedgerStore<L: ScopedLock = FileLockManager> {
    path: PathBuf,
    locks: L,
    lock_timeout: Duration,
    max_entries: usize,
}

impl<L: ScopedLock> LedgerStore<L> {
    pub fn new(path: impl Into<PathBuf>, locks: L, lock_timeout: Duration, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            locks,
            lock_timeout,
            max_entries: max_entries.max(1),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Lock-free read of the last published document.
    pub fn read(&self) -> Result<LedgerDocument> {
        let loaded = persist::load_json_or_default::<LedgerDocument>(&self.path)?;
        if let LoadStatus::Corrupt { reason } = &loaded.status {
            tracing::warn!(path = %self.path.display(), %reason, "Ledger is corrupt; reading as empty");
        }
        Ok(loaded.value)
    }

    /// Size and age facts without taking the lock.
    pub fn meta(&self) -> Result<LedgerMeta> {
        let loaded = persist::load_json_or_default::<LedgerDocument>(&self.path)?;
        Ok(LedgerMeta::of(&loaded.value, loaded.size_bytes))
    }

    /// Append one event, evicting the oldest entries beyond the cap.
    pub fn append(&self, event: Event) -> Result<AppendReceipt> {
        let event_type = event.event_type.clone();
        let cap = self.max_entries;
        let receipt = self.locked_update(|doc, _| {
            doc.activities.push(Activity::Event(event));
            let evicted = apply_retention(&mut doc.activities, cap);
            Ok((
                AppendReceipt {
                    entries: doc.activities.len(),
                    evicted,
                },
                Commit::Publish,
            ))
        })?;
        tracing::info!(
            event_type = %event_type,
            entries = receipt.entries,
            evicted = receipt.evicted,
            "Appended ledger event"
        );
        Ok(receipt)
    }

    /// Record `phase` as current and add it to the phase history.
    pub fn set_phase(&self, phase: Phase) -> Result<()> {
        let value = serde_json::to_value(&phase)?;
        self.locked_update(|doc, _| {
            doc.current_phase = Some(value.clone());
            doc.phase_history.push(value);
            Ok(((), Commit::Publish))
        })?;
        tracing::info!(phase = %phase.id, status = %phase.status, "Set pipeline phase");
        Ok(())
    }

    /// Lock-free read of the current phase.
    pub fn current_phase(&self) -> Result<Option<Phase>> {
        Ok(self.read()?.phase())
    }

    /// Run one read-modify-write cycle under the ledger lock.
    pub(crate) fn locked_update<R>(
        &self,
        update: impl FnOnce(&mut LedgerDocument, u64) -> Result<(R, Commit)>,
    ) -> Result<R> {
        persist::update_locked(&self.locks, LEDGER_LOCK, self.lock_timeout, &self.path, update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Backoff;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(tmp: &TempDir, cap: usize) -> LedgerStore {
        LedgerStore::new(
            tmp.path().join("docs/pipeline-log.json"),
            FileLockManager::new(tmp.path().join("locks"), Backoff::default()),
            Duration::from_secs(2),
            cap,
        )
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 12, minute, 0).unwrap()
    }

    fn event(n: u64) -> Event {
        Event::new("build", json!({ "n": n }), at(0)).unwrap()
    }

    #[test]
    fn append_creates_document() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10);
        let receipt = store.append(event(1)).unwrap();
        assert_eq!(receipt, AppendReceipt { entries: 1, evicted: 0 });

        let doc = store.read().unwrap();
        assert_eq!(doc.activities.len(), 1);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["activities"][0]["type"], "build");
        assert_eq!(raw["activities"][0]["details"]["n"], 1);
        assert!(raw["phase_history"].as_array().unwrap().is_empty());
    }

    #[test]
    fn retention_evicts_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 3);
        for n in 1..=5 {
            store.append(event(n)).unwrap();
        }
        let doc = store.read().unwrap();
        let ns: Vec<u64> = doc
            .activities
            .iter()
            .filter_map(|a| a.as_event()?.details["n"].as_u64())
            .collect();
        assert_eq!(ns, vec![3, 4, 5]);
    }

    #[test]
    fn apply_retention_reports_evictions() {
        let mut items: Vec<u32> = (0..10).collect();
        assert_eq!(apply_retention(&mut items, 4), 6);
        assert_eq!(items, vec![6, 7, 8, 9]);
        assert_eq!(apply_retention(&mut items, 4), 0);
    }

    #[test]
    fn empty_event_type_rejected() {
        assert!(matches!(
            Event::new("  ", Value::Null, at(0)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_fields_survive_rewrite() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{
                "activities": [
                    {"timestamp": "2025-01-01T00:00:00", "type": "legacy", "details": {}, "runner": "mac-1"},
                    {"note": "hand edited"}
                ],
                "phase_history": [],
                "entries": [{"message": "old format"}]
            }"#,
        )
        .unwrap();

        store.append(event(1)).unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["entries"][0]["message"], "old format");
        assert_eq!(raw["activities"][0]["runner"], "mac-1");
        assert_eq!(raw["activities"][1]["note"], "hand edited");
        assert_eq!(raw["activities"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn corrupt_ledger_is_quarantined_then_replaced() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10);
        let dir = store.path().parent().unwrap().to_path_buf();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(store.path(), "{\"activities\": [").unwrap();

        assert!(store.read().unwrap().activities.is_empty());
        store.append(event(1)).unwrap();

        let quarantined: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(
            std::fs::read_to_string(quarantined[0].path()).unwrap(),
            "{\"activities\": ["
        );
        assert_eq!(store.read().unwrap().activities.len(), 1);
    }

    #[test]
    fn phase_is_set_and_recorded_in_history() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10);
        assert!(store.current_phase().unwrap().is_none());

        store.set_phase(Phase::new("build", "Build", "in_progress", at(1))).unwrap();
        store.set_phase(Phase::new("test", "Test", "in_progress", at(2))).unwrap();

        let phase = store.current_phase().unwrap().unwrap();
        assert_eq!(phase.id, "test");
        assert_eq!(phase.started_at, at(2));
        let doc = store.read().unwrap();
        assert_eq!(doc.phase_history.len(), 2);
        assert_eq!(doc.phase_id().as_deref(), Some("test"));
    }

    #[test]
    fn status_event_shape() {
        let e = Event::status(
            StatusLevel::Warning,
            "flaky test",
            "test",
            Some(json!({"retries": 2})),
            at(3),
        );
        assert_eq!(e.event_type, "warning");
        assert_eq!(e.details["message"], "flaky test");
        assert_eq!(e.details["phase"], "test");
        assert_eq!(e.details["metadata"]["retries"], 2);
    }

    #[test]
    fn status_level_parsing() {
        assert_eq!("SUCCESS".parse::<StatusLevel>().unwrap(), StatusLevel::Success);
        assert_eq!("warn".parse::<StatusLevel>().unwrap(), StatusLevel::Warning);
        assert!("fatal".parse::<StatusLevel>().is_err());
    }

    #[test]
    fn lock_timeout_leaves_ledger_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = LedgerStore::new(
            tmp.path().join("log.json"),
            FileLockManager::new(tmp.path().join("locks"), Backoff::default()),
            Duration::from_millis(150),
            10,
        );
        store.append(event(1)).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let holder = FileLockManager::new(tmp.path().join("locks"), Backoff::default());
        let _guard = holder.acquire(LEDGER_LOCK, Duration::from_secs(1)).unwrap();

        let err = store.append(event(2)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn recent_and_meta() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10);
        for (n, minute) in [(1, 5), (2, 1), (3, 9)] {
            store
                .append(Event::new("x", json!({ "n": n }), at(minute)).unwrap())
                .unwrap();
        }
        let doc = store.read().unwrap();
        assert_eq!(doc.recent(2).len(), 2);
        assert_eq!(doc.recent(50).len(), 3);

        let meta = store.meta().unwrap();
        assert_eq!(meta.entries, 3);
        assert_eq!(meta.oldest, Some(at(1)));
        assert!(meta.size_bytes > 0);
    }
}
