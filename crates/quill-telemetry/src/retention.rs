//! Count-based retention of rotated log files

use crate::rotation::{LogFileManager, RotatedFile};
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Keeps at most `max_files` rotated files, deleting the oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_files: usize,
}

impl RetentionPolicy {
    pub fn new(max_files: usize) -> Self {
        Self { max_files }
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// Split off the files that exceed the limit. `files` must be sorted oldest
    /// first and keeps only the survivors.
    pub fn select_expired(&self, files: &mut Vec<RotatedFile>) -> Vec<RotatedFile> {
        let excess = files.len().saturating_sub(self.max_files);
        files.drain(..excess).collect()
    }

    /// Path-only variant of [`select_expired`](Self::select_expired)
    pub fn select_expired_paths(&self, paths: &mut Vec<PathBuf>) -> Vec<PathBuf> {
        let excess = paths.len().saturating_sub(self.max_files);
        paths.drain(..excess).collect()
    }

    pub fn remove_files(&self, files: &[RotatedFile]) -> u32 {
        let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        self.remove_paths(&paths)
    }

    /// Delete the given files, returning how many were removed. Failures are
    /// reported and skipped.
    pub fn remove_paths(&self, paths: &[PathBuf]) -> u32 {
        let mut removed_count = 0;

        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    removed_count += 1;
                    info!(
                        telemetry.event = "rotated_file_removed",
                        file = %path.display(),
                        "Removed rotated log file"
                    );
                }
                Err(e) => {
                    eprintln!("quill: failed to remove {}: {}", path.display(), e);
                    warn!(
                        telemetry.event = "file_removal_failed",
                        file = %path.display(),
                        error = %e,
                        "Failed to remove rotated log file"
                    );
                }
            }
        }

        removed_count
    }

    /// Scan `log_dir` and enforce the limit on what is found there
    pub fn perform_cleanup(&self, log_dir: &Path, base_name: &str) -> Result<CleanupReport> {
        let mut files = LogFileManager::find_rotated_files(log_dir, base_name)?;

        let mut report = CleanupReport {
            initial_file_count: files.len(),
            initial_total_size_bytes: LogFileManager::calculate_total_size(&files),
            ..CleanupReport::default()
        };

        let expired = self.select_expired(&mut files);
        report.files_removed = self.remove_files(&expired);

        let remaining = LogFileManager::find_rotated_files(log_dir, base_name)?;
        report.final_file_count = remaining.len();
        report.final_total_size_bytes = LogFileManager::calculate_total_size(&remaining);

        info!(
            telemetry.event = "retention_cleanup_completed",
            log_dir = %log_dir.display(),
            initial_files = report.initial_file_count,
            final_files = report.final_file_count,
            files_removed = report.files_removed,
            "Log cleanup completed"
        );

        Ok(report)
    }
}

/// Outcome of a cleanup pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub initial_file_count: usize,
    pub initial_total_size_bytes: u64,
    pub files_removed: u32,
    pub final_file_count: usize,
    pub final_total_size_bytes: u64,
}
