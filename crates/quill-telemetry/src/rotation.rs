//! Daily log file rotation
//!
//! The active file is `<base>.log`. When a write lands in a later rotation
//! period than the one the file was opened in, the file is renamed to
//! `<base>-<YYYY-MM-DD>.log` (the date of the period being closed), a fresh file
//! is opened and rotated files beyond the retention count are deleted.

use crate::config::TelemetryConfig;
use crate::retention::RetentionPolicy;
use crate::sink::Sink;
use crate::{Error, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed time of day, in the reference zone, at which a new period starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyBoundary {
    offset: FixedOffset,
    time: NaiveTime,
}

impl DailyBoundary {
    pub fn new(offset: FixedOffset, time: NaiveTime) -> Self {
        Self { offset, time }
    }

    /// The date labelling the period that contains `instant`
    pub fn period_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        let local = instant.with_timezone(&self.offset);
        let date = local.date_naive();
        if local.time() >= self.time {
            date
        } else {
            date.pred_opt().unwrap_or(date)
        }
    }
}

/// Snapshot of the sink's rotation bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationState {
    pub current_path: PathBuf,
    pub current_period: NaiveDate,
    /// Retained rotated files, oldest first
    pub rotated_files: Vec<PathBuf>,
    pub rotations: u64,
    /// Whether the configured directory was unwritable and the fallback is in use
    pub fallback_active: bool,
}

/// Everything needed to open a rotating sink
#[derive(Clone)]
pub struct RotationSettings {
    pub log_dir: PathBuf,
    pub fallback_log_dir: PathBuf,
    pub base_name: String,
    pub boundary: DailyBoundary,
    pub retention_files: usize,
    pub clock: Arc<dyn Clock>,
}

impl RotationSettings {
    pub fn from_config(config: &TelemetryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            log_dir: config.logging.log_dir.clone(),
            fallback_log_dir: config.logging.fallback_log_dir.clone(),
            base_name: config.logging.log_file_name.clone(),
            boundary: DailyBoundary::new(config.time_zone()?.offset(), config.rotation_boundary()?),
            retention_files: config.rotation.retention_files as usize,
            clock,
        })
    }
}

struct SinkInner {
    file: Option<File>,
    state: RotationState,
}

/// File sink that rotates daily and prunes old files
pub struct RotatingFileSink {
    log_dir: PathBuf,
    base_name: String,
    boundary: DailyBoundary,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<SinkInner>,
}

impl RotatingFileSink {
    /// Open the sink, falling back once to the secondary directory if the
    /// configured one is not writable
    pub fn open(settings: RotationSettings) -> Result<Self> {
        let (log_dir, fallback_active) =
            choose_log_dir(&settings.log_dir, &settings.fallback_log_dir)?;

        let retention = RetentionPolicy::new(settings.retention_files);
        let current_path = log_dir.join(LogFileManager::current_file_name(&settings.base_name));
        let now = settings.clock.now();
        let current_period = settings.boundary.period_of(now);

        let mut rotated = LogFileManager::find_rotated_files(&log_dir, &settings.base_name)?;
        let mut rotations = 0;

        // A leftover active file from an earlier period is rotated under its own date
        if let Some(stale_period) = stale_period_of(&current_path, &settings.boundary) {
            if stale_period < current_period {
                let target = LogFileManager::unique_rotated_path(
                    &log_dir,
                    &settings.base_name,
                    stale_period,
                );
                std::fs::rename(&current_path, &target)?;
                let index = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| LogFileManager::parse_rotated_parts(&settings.base_name, n))
                    .map_or(0, |(_, index)| index);
                rotated.push(RotatedFile {
                    path: target,
                    date: stale_period,
                    index,
                    size: 0,
                });
                LogFileManager::sort_oldest_first(&mut rotated);
                rotations += 1;
            }
        }

        let expired = retention.select_expired(&mut rotated);
        retention.remove_files(&expired);

        let file = open_append(&current_path)?;

        tracing::debug!(
            telemetry.event = "log_file_opened",
            file_path = %current_path.display(),
            fallback_active,
            retained = rotated.len(),
            "Log file opened"
        );

        Ok(Self {
            log_dir,
            base_name: settings.base_name,
            boundary: settings.boundary,
            retention,
            clock: settings.clock,
            inner: Mutex::new(SinkInner {
                file: Some(file),
                state: RotationState {
                    current_path,
                    current_period,
                    rotated_files: rotated.into_iter().map(|f| f.path).collect(),
                    rotations,
                    fallback_active,
                },
            }),
        })
    }

    /// Directory actually in use (the fallback when it was taken)
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn state(&self) -> RotationState {
        self.lock().state.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rename the active file for the closing period and reopen.
    /// Returns rotated files that fell out of retention; they are deleted by the
    /// caller once the lock is released.
    fn rotate_locked(&self, inner: &mut SinkInner, new_period: NaiveDate) -> Result<Vec<PathBuf>> {
        if let Some(mut file) = inner.file.take() {
            file.flush()?;
        }

        let closing_period = inner.state.current_period;
        let current_path = inner.state.current_path.clone();

        if current_path.exists() {
            let target =
                LogFileManager::unique_rotated_path(&self.log_dir, &self.base_name, closing_period);
            std::fs::rename(&current_path, &target).map_err(|e| Error::Rotation {
                message: format!(
                    "Failed to rename {} to {}: {}",
                    current_path.display(),
                    target.display(),
                    e
                ),
            })?;
            inner.state.rotated_files.push(target.clone());

            tracing::info!(
                telemetry.event = "log_rotated",
                old_file = %current_path.display(),
                new_file = %target.display(),
                period = %closing_period,
                "Log file rotated"
            );
        }

        inner.state.current_period = new_period;
        inner.state.rotations += 1;

        let expired = self
            .retention
            .select_expired_paths(&mut inner.state.rotated_files);
        Ok(expired)
    }

    fn write_locked(inner: &mut SinkInner, line: &str) -> io::Result<()> {
        if inner.file.is_none() {
            inner.file = Some(open_append(&inner.state.current_path)?);
        }
        let Some(file) = inner.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "No file open"));
        };

        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');
        file.write_all(&record)
    }
}

impl Sink for RotatingFileSink {
    fn name(&self) -> &'static str {
        "rotating_file"
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let (expired, result) = {
            let mut inner = self.lock();
            let period = self.boundary.period_of(self.clock.now());
            let mut expired = Vec::new();
            if period > inner.state.current_period {
                match self.rotate_locked(&mut inner, period) {
                    Ok(paths) => expired = paths,
                    Err(e) => eprintln!("quill: log rotation failed: {}", e),
                }
            }
            let result = Self::write_locked(&mut inner, line);
            (expired, result)
        };

        if !expired.is_empty() {
            self.retention.remove_paths(&expired);
        }
        result
    }

    fn flush(&self) -> io::Result<()> {
        let mut inner = self.lock();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    fn rotation_state(&self) -> Option<RotationState> {
        Some(self.state())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Rotation period in which an existing, non-empty active file was last written
fn stale_period_of(path: &Path, boundary: &DailyBoundary) -> Option<NaiveDate> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.len() == 0 {
        return None;
    }
    let modified: DateTime<Utc> = metadata.modified().ok()?.into();
    Some(boundary.period_of(modified))
}

/// Check that `dir` can be created and written to
fn probe_writable(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".quill_write_test");
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)
}

/// Pick the configured directory, or the fallback once when it is not writable
fn choose_log_dir(primary: &Path, fallback: &Path) -> Result<(PathBuf, bool)> {
    match probe_writable(primary) {
        Ok(()) => Ok((primary.to_path_buf(), false)),
        Err(primary_err) => {
            eprintln!(
                "quill: log directory {} is not writable ({}); using {}",
                primary.display(),
                primary_err,
                fallback.display()
            );
            probe_writable(fallback).map_err(|fallback_err| Error::Rotation {
                message: format!(
                    "Neither {} ({}) nor fallback {} ({}) is writable",
                    primary.display(),
                    primary_err,
                    fallback.display(),
                    fallback_err
                ),
            })?;
            tracing::warn!(
                telemetry.event = "log_dir_fallback",
                primary = %primary.display(),
                fallback = %fallback.display(),
                "Using fallback log directory"
            );
            Ok((fallback.to_path_buf(), true))
        }
    }
}

/// Utility functions for log file naming and discovery
pub struct LogFileManager;

impl LogFileManager {
    pub fn current_file_name(base_name: &str) -> String {
        format!("{}.log", base_name)
    }

    pub fn rotated_file_name(base_name: &str, date: NaiveDate) -> String {
        format!("{}-{}.log", base_name, date.format("%Y-%m-%d"))
    }

    /// `<base>-<date>.log`, or `<base>-<date>.<n>.log` if that name is taken
    pub fn unique_rotated_path(log_dir: &Path, base_name: &str, date: NaiveDate) -> PathBuf {
        let primary = log_dir.join(Self::rotated_file_name(base_name, date));
        if !primary.exists() {
            return primary;
        }
        (1u32..)
            .map(|n| log_dir.join(format!("{}-{}.{}.log", base_name, date.format("%Y-%m-%d"), n)))
            .find(|candidate| !candidate.exists())
            .unwrap_or(primary)
    }

    /// Rotation date encoded in a rotated file name, if it is one of ours
    pub fn parse_rotated_name(base_name: &str, file_name: &str) -> Option<NaiveDate> {
        Self::parse_rotated_parts(base_name, file_name).map(|(date, _)| date)
    }

    /// Rotation date and collision index (`0` for the unsuffixed name)
    pub fn parse_rotated_parts(base_name: &str, file_name: &str) -> Option<(NaiveDate, u32)> {
        let rest = file_name.strip_prefix(base_name)?.strip_prefix('-')?;
        let rest = rest.strip_suffix(".log")?;
        let date = NaiveDate::parse_from_str(rest.get(..10)?, "%Y-%m-%d").ok()?;
        let index = match rest.get(10..)? {
            "" => 0,
            tail => {
                let digits = tail.strip_prefix('.')?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok()?
            }
        };
        Some((date, index))
    }

    /// Order by rotation date, then by collision index as a number
    pub fn sort_oldest_first(files: &mut [RotatedFile]) {
        files.sort_by_key(|f| (f.date, f.index));
    }

    /// Rotated files for `base_name` in `log_dir`, oldest first
    pub fn find_rotated_files(log_dir: &Path, base_name: &str) -> Result<Vec<RotatedFile>> {
        let mut files = Vec::new();

        if !log_dir.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(log_dir)? {
            let entry = entry?;
            let path = entry.path();

            if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some((date, index)) = Self::parse_rotated_parts(base_name, file_name) {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    files.push(RotatedFile {
                        path,
                        date,
                        index,
                        size,
                    });
                }
            }
        }

        Self::sort_oldest_first(&mut files);
        Ok(files)
    }

    /// Calculate total disk usage of log files
    pub fn calculate_total_size(files: &[RotatedFile]) -> u64 {
        files.iter().map(|f| f.size).sum()
    }
}

/// A rotated log file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedFile {
    pub path: PathBuf,
    pub date: NaiveDate,
    /// Collision suffix `n` of `<base>-<date>.<n>.log`, `0` when absent
    pub index: u32,
    pub size: u64,
}
