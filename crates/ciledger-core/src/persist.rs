//! Durable JSON document persistence.
//!
//! Writers publish complete documents by writing a temp file in the target's
//! directory, syncing it, and renaming it over the canonical path. A crash
//! at any point leaves either the previous or the new document in place, so
//! lock-free readers never observe a torn write.
//!
//! Loading is tolerant: a missing file yields the default document and an
//! unparsable one is reported as [`LoadStatus::Corrupt`] so the caller can
//! quarantine it and continue.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::lock::ScopedLock;
use crate::timestamp;

/// How a document was obtained from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// No file (or an empty one); the default document was used.
    Missing,
    /// The file parsed cleanly.
    Loaded,
    /// The file exists but could not be parsed; the default was used.
    Corrupt { reason: String },
}

/// A loaded document together with its provenance.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub status: LoadStatus,
    /// Size of the file on disk in bytes (0 when missing).
    pub size_bytes: u64,
}

impl<T> Loaded<T> {
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self.status, LoadStatus::Corrupt { .. })
    }
}

/// Load a JSON document, falling back to `T::default()` when absent or corrupt.
///
/// Only genuine I/O failures (permissions, unreadable media) are errors.
pub fn load_json_or_default<T>(path: &Path) -> Result<Loaded<T>>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Loaded {
                value: T::default(),
                status: LoadStatus::Missing,
                size_bytes: 0,
            });
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            // Not UTF-8: same treatment as unparsable JSON.
            let size_bytes = fs::metadata(path).map_or(0, |m| m.len());
            return Ok(Loaded {
                value: T::default(),
                status: LoadStatus::Corrupt {
                    reason: e.to_string(),
                },
                size_bytes,
            });
        }
        Err(e) => return Err(Error::io(path, e)),
    };

    let size_bytes = raw.len() as u64;
    if raw.trim().is_empty() {
        return Ok(Loaded {
            value: T::default(),
            status: LoadStatus::Missing,
            size_bytes,
        });
    }

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Loaded {
            value,
            status: LoadStatus::Loaded,
            size_bytes,
        }),
        Err(e) => Ok(Loaded {
            value: T::default(),
            status: LoadStatus::Corrupt {
                reason: e.to_string(),
            },
            size_bytes,
        }),
    }
}

/// Serialize `value` as pretty JSON and publish it atomically at `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    write_atomic(path, &json)
}

/// Publish `bytes` at `path` via temp file + fsync + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let tmp_path = temp_path_for(path);
    let result = write_file_sync(&tmp_path, bytes)
        .and_then(|()| fs::rename(&tmp_path, path))
        .map_err(|e| Error::io(path, e));

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
        return result;
    }

    sync_dir(dir);
    tracing::trace!(path = %path.display(), bytes = bytes.len(), "Published document");
    Ok(())
}

/// Whether a locked update should publish its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Publish,
    Discard,
}

/// Run one read-modify-write cycle on the document at `path` while holding
/// the `resource` lock.
///
/// `update` receives the freshly loaded document and its on-disk size. A
/// corrupt document is quarantined before it is overwritten; nothing is
/// written when `update` fails or returns [`Commit::Discard`].
pub fn update_locked<L, T, R>(
    locks: &L,
    resource: &str,
    timeout: Duration,
    path: &Path,
    update: impl FnOnce(&mut T, u64) -> Result<(R, Commit)>,
) -> Result<R>
where
    L: ScopedLock,
    T: Serialize + DeserializeOwned + Default,
{
    let _guard = locks.acquire(resource, timeout)?;

    let loaded = load_json_or_default::<T>(path)?;
    if let LoadStatus::Corrupt { reason } = &loaded.status {
        tracing::warn!(path = %path.display(), %reason, "Document is corrupt; starting from default");
    }
    let corrupt = loaded.is_corrupt();

    let mut doc = loaded.value;
    let (out, commit) = update(&mut doc, loaded.size_bytes)?;
    if commit == Commit::Publish {
        if corrupt {
            quarantine(path, Utc::now())?;
        }
        write_json_atomic(path, &doc)?;
    }
    Ok(out)
}

/// Copy a corrupt document aside as `<name>.corrupt-<stamp>` before it is replaced.
pub fn quarantine(path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let base = format!("{file_name}.corrupt-{}", timestamp::file_stamp(now));
    let target = unique_path(parent_dir(path), &base, "");
    fs::copy(path, &target).map_err(|e| Error::io(&target, e))?;
    tracing::warn!(
        path = %path.display(),
        quarantined = %target.display(),
        "Quarantined corrupt document"
    );
    Ok(target)
}

/// First non-existing path among `<dir>/<stem><ext>`, `<dir>/<stem>-1<ext>`, ...
pub(crate) fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}{ext}"));
    if !first.exists() {
        return first;
    }
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Temp file used while publishing `path`. Lives in the same directory so
/// the rename never crosses filesystems.
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    parent_dir(path).join(format!(".{file_name}.{}.tmp", std::process::id()))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_file_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(data)?;
    f.sync_all()
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
