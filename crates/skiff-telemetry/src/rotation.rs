//! Segment rotation policies

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use skiff_core::RotationFrequency;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Decides when the active segment rolls over, what the closed segment is
/// called, and which closed segments fall outside local retention.
///
/// The writer calls [`RotationPolicy::files_to_delete`] after every rollover
/// and decides itself what happens to the returned files.
pub trait RotationPolicy: Send + 'static {
    /// First rollover instant strictly after `now`
    fn next_rollover(&self, now: DateTime<Utc>) -> DateTime<Utc>;

    /// Name for the segment at `active`, opened at `opened_at`, once closed
    fn rotated_path(&self, active: &Path, opened_at: DateTime<Utc>) -> PathBuf;

    /// Closed segments belonging to `active` beyond local retention, oldest first
    fn files_to_delete(&self, active: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Clock-aligned rotation every hour or minute
#[derive(Debug, Clone)]
pub struct TimedRotation {
    frequency: RotationFrequency,
    backup_count: u32,
    // Closed segments leave for these directories under the same name
    reserved_dirs: Vec<PathBuf>,
}

impl TimedRotation {
    /// `backup_count` closed segments are kept locally; with 0 every closed
    /// segment is immediately eligible for deletion.
    pub fn new(frequency: RotationFrequency, backup_count: u32) -> Self {
        Self {
            frequency,
            backup_count,
            reserved_dirs: Vec::new(),
        }
    }

    /// A rotated name is only handed out when it is also free in every one
    /// of `dirs`.
    pub fn with_reserved_dirs<I>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.reserved_dirs = dirs.into_iter().collect();
        self
    }

    fn is_taken(&self, candidate: &Path) -> bool {
        if candidate.exists() {
            return true;
        }
        match candidate.file_name() {
            Some(name) => self.reserved_dirs.iter().any(|dir| dir.join(name).exists()),
            None => false,
        }
    }

    pub fn frequency(&self) -> RotationFrequency {
        self.frequency
    }

    fn period_secs(&self) -> i64 {
        self.frequency.period().as_secs() as i64
    }

    /// Start of the interval containing `instant`
    pub fn interval_start(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        interval_start(self.frequency, instant)
    }
}

/// Start of the hour or minute containing `instant`
pub fn interval_start(frequency: RotationFrequency, instant: DateTime<Utc>) -> DateTime<Utc> {
    let period = frequency.period().as_secs() as i64;
    let start = instant.timestamp().div_euclid(period) * period;
    DateTime::from_timestamp(start, 0).unwrap_or(instant)
}

impl RotationPolicy for TimedRotation {
    fn next_rollover(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.interval_start(now) + ChronoDuration::seconds(self.period_secs())
    }

    fn rotated_path(&self, active: &Path, opened_at: DateTime<Utc>) -> PathBuf {
        let stem = segment_base(active);
        let when = self
            .interval_start(opened_at)
            .format(self.frequency.suffix_format())
            .to_string();
        let dir = active.parent().unwrap_or_else(|| Path::new("."));

        let mut candidate = dir.join(format!("{}.{}.log", stem, when));
        let mut counter = 1;
        while self.is_taken(&candidate) {
            candidate = dir.join(format!("{}.{}.{}.log", stem, when, counter));
            counter += 1;
        }
        candidate
    }

    fn files_to_delete(&self, active: &Path) -> io::Result<Vec<PathBuf>> {
        let mut closed = closed_segments(active)?;
        let keep = self.backup_count as usize;
        if closed.len() <= keep {
            return Ok(Vec::new());
        }
        let excess = closed.len() - keep;
        closed.truncate(excess);
        Ok(closed.into_iter().map(|segment| segment.path).collect())
    }
}

/// A closed segment found next to the active one
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// `<app>_<session-id>` for an active segment path
fn segment_base(active: &Path) -> String {
    active
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("segment")
        .to_string()
}

/// Closed segments of the session owning `active`, oldest first.
/// Order comes from the rotated names; modification time breaks ties.
pub fn closed_segments(active: &Path) -> io::Result<Vec<ClosedSegment>> {
    let dir = match active.parent() {
        Some(dir) if dir.is_dir() => dir,
        _ => return Ok(Vec::new()),
    };
    let prefix = format!("{}.", segment_base(active));

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == active || !entry.file_type()?.is_file() {
            continue;
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with(&prefix) && name.ends_with(".log") {
                let modified = entry.metadata()?.modified()?;
                segments.push(ClosedSegment { path, modified });
            }
        }
    }

    segments.sort_by(|a, b| {
        order_key(&a.path, &prefix)
            .cmp(&order_key(&b.path, &prefix))
            .then_with(|| a.modified.cmp(&b.modified))
    });
    Ok(segments)
}

/// `(interval, collision counter)` parsed from `<base>.<interval>[.<n>].log`.
/// Interval suffixes sort chronologically as plain strings.
fn order_key(path: &Path, prefix: &str) -> (String, u32) {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let middle = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".log"))
        .unwrap_or(name);

    match middle.rsplit_once('.') {
        Some((interval, counter)) => match counter.parse::<u32>() {
            Ok(n) => (interval.to_string(), n),
            Err(_) => (middle.to_string(), 0),
        },
        None => (middle.to_string(), 0),
    }
}
