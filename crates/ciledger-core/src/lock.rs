//! Named cross-process locks over advisory file locks.
//!
//! Each resource (`status`, `budget-state`, ...) maps to `<lock_dir>/<name>.lock`
//! and is guarded with an exclusive OS-level lock (via fs2). Acquisition
//! never blocks in the kernel: it polls with exponential backoff plus jitter
//! until the lock is obtained or the timeout elapses.
//!
//! A sidecar `<name>.lock.meta.json` records who holds the lock, for
//! debugging stuck pipelines.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LockConfig;
use crate::persist;
use crate::timestamp;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock stayed held by another process for the whole timeout.
    #[error("timed out after {waited:?} waiting for lock '{resource}'")]
    Timeout { resource: String, waited: Duration },

    /// Resource names become file names and must be plain identifiers.
    #[error("invalid lock resource name '{0}'")]
    InvalidName(String),

    /// I/O error during lock operations.
    #[error("lock I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Scoped mutual exclusion over a named resource.
///
/// The returned guard releases the lock when dropped, on every exit path.
pub trait ScopedLock {
    type Guard;

    fn acquire(&self, resource: &str, timeout: Duration) -> Result<Self::Guard, LockError>;
}

/// Diagnostic metadata written alongside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Resource name.
    pub resource: String,
    /// When the lock was acquired (RFC 3339, UTC).
    pub acquired_at: String,
    /// Version of ciledger that acquired the lock.
    pub version: String,
}

/// Exponential backoff between acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), scaled by `jitter`.
    ///
    /// `jitter` is expected in `[0.5, 1.0)`; the unjittered delay doubles
    /// from `base` and is capped at `max`.
    #[must_use]
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .saturating_mul(factor)
            .min(self.max)
            .mul_f64(jitter.clamp(0.0, 1.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        }
    }
}

/// File-backed lock manager rooted at a lock directory.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    lock_dir: PathBuf,
    backoff: Backoff,
}

impl FileLockManager {
    #[must_use]
    pub fn new(lock_dir: impl Into<PathBuf>, backoff: Backoff) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            backoff,
        }
    }

    #[must_use]
    pub fn from_config(lock_dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self::new(
            lock_dir,
            Backoff {
                base: Duration::from_millis(config.base_backoff_ms),
                max: Duration::from_millis(config.max_backoff_ms),
            },
        )
    }

    #[must_use]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Path of the lock file backing `resource`.
    #[must_use]
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.lock_dir.join(format!("{resource}.lock"))
    }

    /// Report the current holder of `resource` without acquiring it.
    ///
    /// Returns `None` when the lock is free or no metadata is available.
    #[must_use]
    pub fn holder(&self, resource: &str) -> Option<LockMetadata> {
        let lock_path = self.lock_path(resource);
        let lock_file = OpenOptions::new().read(true).open(&lock_path).ok()?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&lock_file);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fs::read_to_string(metadata_path(&lock_path))
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
            }
            Err(_) => None,
        }
    }

    fn open_lock_file(&self, lock_path: &Path) -> Result<File, LockError> {
        fs::create_dir_all(&self.lock_dir).map_err(|source| LockError::Io {
            path: self.lock_dir.clone(),
            source,
        })?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|source| LockError::Io {
                path: lock_path.to_path_buf(),
                source,
            })
    }
}

impl ScopedLock for FileLockManager {
    type Guard = LockGuard;

    fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        validate_resource_name(resource)?;
        let lock_path = self.lock_path(resource);
        let lock_file = self.open_lock_file(&lock_path)?;

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        tracing::warn!(
                            resource,
                            waited_ms = waited.as_millis() as u64,
                            attempts = attempt + 1,
                            "Lock acquisition timed out"
                        );
                        return Err(LockError::Timeout {
                            resource: resource.to_string(),
                            waited,
                        });
                    }
                    let jitter = rand::rng().random_range(0.5..1.0);
                    let delay = self.backoff.delay(attempt, jitter).min(timeout - waited);
                    std::thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: lock_path,
                        source,
                    });
                }
            }
        }

        let guard = LockGuard {
            file: lock_file,
            resource: resource.to_string(),
            meta_path: metadata_path(&lock_path),
            lock_path,
            acquired: Instant::now(),
        };
        guard.write_metadata();
        tracing::debug!(
            resource,
            attempts = attempt + 1,
            waited_ms = started.elapsed().as_millis() as u64,
            "Acquired lock"
        );
        Ok(guard)
    }
}

/// An acquired lock. Released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    file: File,
    resource: String,
    lock_path: PathBuf,
    meta_path: PathBuf,
    acquired: Instant,
}

impl LockGuard {
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    #[must_use]
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    fn write_metadata(&self) {
        let metadata = LockMetadata {
            pid: std::process::id(),
            resource: self.resource.clone(),
            acquired_at: timestamp::format_instant(Utc::now()),
            version: crate::VERSION.to_string(),
        };
        // Diagnostics only; never fail the critical section over it.
        if let Err(e) = persist::write_json_atomic(&self.meta_path, &metadata) {
            tracing::debug!(meta_path = %self.meta_path.display(), error = %e, "Failed to write lock metadata");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("lock_path", &self.lock_path)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %self.meta_path.display(),
                    error = %e,
                    "Failed to remove lock metadata"
                );
            }
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the descriptor below releases it regardless.
            tracing::debug!(resource = %self.resource, error = %e, "Explicit unlock failed");
        }
        tracing::debug!(
            resource = %self.resource,
            held_ms = self.acquired.elapsed().as_millis() as u64,
            "Released lock"
        );
    }
}

fn validate_resource_name(resource: &str) -> Result<(), LockError> {
    let valid = !resource.is_empty()
        && !resource.starts_with('.')
        && resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(LockError::InvalidName(resource.to_string()))
    }
}

/// Compute the metadata sidecar path for a given lock path.
fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}
