//! Retention-based cleanup of CI artifacts with dry-run preview.
//!
//! Walks the configured artifact directories (rotation archives, build logs,
//! snapshots, hook logs) and selects regular files whose modification time
//! is older than the retention window.
//!
//! - **Preview** (dry-run): returns per-directory counts without touching files.
//! - **Apply**: deletes eligible files and returns a summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// One file selected for deletion.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Per-directory cleanup counts for preview and apply results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupDirSummary {
    pub directory: PathBuf,
    pub eligible_files: usize,
    pub deleted_files: usize,
    pub eligible_bytes: u64,
    pub files: Vec<CleanupFile>,
}

/// Full cleanup plan: a list of per-directory summaries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupPlan {
    pub directories: Vec<CleanupDirSummary>,
    pub total_eligible: usize,
    pub total_deleted: usize,
    pub total_bytes: u64,
    pub retention_days: u32,
    pub dry_run: bool,
}

/// Preview what would be cleaned up (dry-run).
pub fn cleanup_preview(dirs: &[PathBuf], retention_days: u32, now: SystemTime) -> Result<CleanupPlan> {
    let cutoff = retention_cutoff(now, retention_days);
    let mut plan = CleanupPlan {
        retention_days,
        dry_run: true,
        ..Default::default()
    };
    for dir in dirs {
        let Some(summary) = scan_directory(dir, cutoff)? else {
            continue;
        };
        plan.total_eligible += summary.eligible_files;
        plan.total_bytes += summary.eligible_bytes;
        plan.directories.push(summary);
    }
    Ok(plan)
}

/// Apply cleanup: delete eligible files and return the result plan.
///
/// A file that vanished between scan and delete is not an error; any other
/// deletion failure aborts with the files deleted so far already gone.
pub fn cleanup_apply(dirs: &[PathBuf], retention_days: u32, now: SystemTime) -> Result<CleanupPlan> {
    let mut plan = cleanup_preview(dirs, retention_days, now)?;
    plan.dry_run = false;

    for summary in &mut plan.directories {
        for file in &summary.files {
            match fs::remove_file(&file.path) {
                Ok(()) => summary.deleted_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&file.path, e)),
            }
        }
        plan.total_deleted += summary.deleted_files;
        if summary.deleted_files > 0 {
            tracing::info!(
                directory = %summary.directory.display(),
                deleted = summary.deleted_files,
                bytes = summary.eligible_bytes,
                "Deleted expired artifacts"
            );
        }
    }
    Ok(plan)
}

/// Files in `dir` (recursively) last modified before `cutoff`.
/// Returns `None` when the directory does not exist.
fn scan_directory(dir: &Path, cutoff: SystemTime) -> Result<Option<CleanupDirSummary>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut summary = CleanupDirSummary {
        directory: dir.to_path_buf(),
        ..Default::default()
    };

    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(directory = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| Error::io(entry.path(), std::io::Error::other(e)))?;
        let modified = meta.modified().map_err(|e| Error::io(entry.path(), e))?;
        if modified < cutoff {
            summary.eligible_files += 1;
            summary.eligible_bytes += meta.len();
            summary.files.push(CleanupFile {
                path: entry.into_path(),
                size_bytes: meta.len(),
            });
        }
    }
    Ok(Some(summary))
}

fn retention_cutoff(now: SystemTime, retention_days: u32) -> SystemTime {
    let window = Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY);
    now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH)
}
