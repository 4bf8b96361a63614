//! Scanner stage: depth-first directory walk producing candidate log paths.
//!
//! A path is a candidate when it is a regular file, its extension is on the
//! log allow-list, and it was modified at or after the cutoff. Directories
//! the process may not list are logged and skipped; any other listing
//! failure aborts the run.
//!
//! The walk is blocking I/O, so it runs on the blocking pool and feeds the
//! bounded output queue with `blocking_send`. The queue closes exactly once,
//! when the walk returns and drops the only sender.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{is_permission_denied, IngestError};
use crate::pipeline::StageHandle;

/// Extensions (lowercase, with the dot) of files worth scoring. The empty
/// string stands for "no extension".
pub const LOG_EXTENSIONS: [&str; 7] = ["", ".log", ".err", ".out", ".stdout", ".stderr", ".txt"];

/// Counters reported by the scanner when the walk ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Paths sent downstream.
    pub sent: u64,
    /// Regular files rejected by extension or cutoff, or gone before their
    /// metadata could be read.
    pub skipped: u64,
    /// Directories or files skipped because access was denied.
    pub denied: u64,
}

/// Suffix of the file name starting at its last `.`, lowercased.
///
/// `app.LOG` gives `.log`, `Makefile` gives the empty string, and a dotfile
/// such as `.profile` is its own extension.
pub fn extension_of(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    match name.rfind('.') {
        Some(dot) => name[dot..].to_lowercase(),
        None => String::new(),
    }
}

pub fn has_log_extension(path: &Path) -> bool {
    let ext = extension_of(path);
    LOG_EXTENSIONS.contains(&ext.as_str())
}

/// Allow-listed extension and modified at or after `cutoff`.
pub fn is_candidate(path: &Path, modified_at: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    if !has_log_extension(path) {
        return false;
    }
    debug!(
        "File {}, modified_at={}, cutoff={}",
        path.display(),
        modified_at,
        cutoff
    );
    modified_at >= cutoff
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Start the scanner stage.
pub fn spawn_scanner(
    root: PathBuf,
    cutoff: DateTime<Utc>,
    excludes: GlobSet,
    capacity: usize,
) -> StageHandle<PathBuf, ScanReport> {
    let (tx, rx) = mpsc::channel(capacity);
    let completion = tokio::task::spawn_blocking(move || -> Result<ScanReport, IngestError> {
        info!(
            "File system scanner starts from {}, CDC start date {}",
            root.display(),
            cutoff
        );
        let report = walk(&root, cutoff, &excludes, &tx)?;
        info!(
            "File system scanner ends: {} files sent to scoring, {} files skipped, {} denied",
            report.sent, report.skipped, report.denied
        );
        Ok(report)
    });
    StageHandle {
        output: rx,
        completion,
    }
}

/// Walk `root` and send every candidate into `tx`.
///
/// Stops early, without error, if the receiving side has gone away.
pub fn walk(
    root: &Path,
    cutoff: DateTime<Utc>,
    excludes: &GlobSet,
    tx: &mpsc::Sender<PathBuf>,
) -> Result<ScanReport, IngestError> {
    let mut report = ScanReport::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded(root, entry.path(), excludes));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                if err.io_error().is_some_and(is_permission_denied) {
                    warn!("Access denied, skipping {}: {}", path.display(), err);
                    report.denied += 1;
                    continue;
                }
                return Err(IngestError::Traversal {
                    path,
                    source: err.into(),
                });
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let modified = entry
            .metadata()
            .map_err(std::io::Error::from)
            .and_then(|m| m.modified());
        let Some(modified_at) = entry_modified(path, modified, &mut report)? else {
            continue;
        };

        if !is_candidate(path, modified_at, cutoff) {
            report.skipped += 1;
            continue;
        }

        if tx.blocking_send(path.to_path_buf()).is_err() {
            debug!("Scanner output closed, stopping walk");
            break;
        }
        report.sent += 1;
    }

    Ok(report)
}

/// Modification time of a walked file, or `None` when the file is to be
/// skipped: access was denied, or it vanished after being listed.
fn entry_modified(
    path: &Path,
    modified: std::io::Result<SystemTime>,
    report: &mut ScanReport,
) -> Result<Option<DateTime<Utc>>, IngestError> {
    match modified {
        Ok(modified) => Ok(Some(DateTime::<Utc>::from(modified))),
        Err(err) if is_permission_denied(&err) => {
            warn!("Access denied, skipping {}: {}", path.display(), err);
            report.denied += 1;
            Ok(None)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} disappeared during the walk, skipping", path.display());
            report.skipped += 1;
            Ok(None)
        }
        Err(err) => Err(IngestError::Traversal {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

fn is_excluded(root: &Path, path: &Path, excludes: &GlobSet) -> bool {
    if excludes.is_empty() {
        return false;
    }
    match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => excludes.is_match(relative),
        _ => false,
    }
}
