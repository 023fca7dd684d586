//! Expiry sweeps over archive and in-flight directories

use metrics::counter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Outcome of one [`sweep`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: u32,
    pub removal_failures: u32,
}

/// Regular files directly inside `dir` last modified before `cutoff`.
///
/// A missing directory yields nothing. Entries whose metadata cannot be read
/// are skipped.
pub fn files_modified_before(dir: &Path, cutoff: SystemTime) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .map(|modified| modified < cutoff)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Delete files older than `cutoff` in each directory.
///
/// A file that cannot be removed is counted and skipped; the sweep always
/// continues with the remaining files.
pub fn sweep<P: AsRef<Path>>(directories: &[P], cutoff: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    for dir in directories {
        for path in files_modified_before(dir.as_ref(), cutoff) {
            match std::fs::remove_file(&path) {
                Ok(()) => report.files_removed += 1,
                Err(_) => report.removal_failures += 1,
            }
        }
    }

    counter!("skiff.sweep.deleted").increment(report.files_removed as u64);
    report
}
