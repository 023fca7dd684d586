//! Rotating segment writer
//!
//! The writer owns the active segment of one session. Rollovers happen when a
//! write crosses the policy boundary or when the lifecycle clock ticks; the
//! closed segment is renamed, a fresh active file is opened, and the policy's
//! retention hook decides which closed segments leave the segment directory.
//! With shipping enabled those are handed to the shipping worker, otherwise
//! they are deleted here.

use crate::clock::LifecycleClock;
use crate::layout::SegmentLayout;
use crate::rotation::{RotationPolicy, TimedRotation};
use crate::shipping::{QueueItem, ShippingQueue, ShippingSummary, ShippingWorker};
use crate::sweeper::{files_modified_before, sweep};
use crate::uploader::Uploader;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use skiff_core::{AppSettings, LogSettings, ShippingSettings};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

/// Lifecycle of a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Active,
    /// Held only while the lock is taken for a rollover
    Rotating,
    Closing,
    Closed,
}

/// The file currently receiving lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub closed: bool,
}

impl LogSegment {
    fn open(path: PathBuf, created_at: DateTime<Utc>) -> Self {
        Self {
            path,
            created_at,
            closed: false,
        }
    }
}

struct WriterCore {
    state: WriterState,
    segment: LogSegment,
    file: Option<File>,
    policy: Box<dyn RotationPolicy>,
    next_rollover: DateTime<Utc>,
    // Closed segments already given to the worker that may still be on disk
    handed_off: HashSet<PathBuf>,
}

#[derive(Default)]
struct Background {
    clock: Option<LifecycleClock>,
    worker: Option<JoinHandle<ShippingSummary>>,
}

struct WriterInner {
    layout: SegmentLayout,
    shipping: bool,
    queue: ShippingQueue,
    close_timeout: Duration,
    core: Mutex<WriterCore>,
    background: Mutex<Background>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_segment(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Time-based rotation whose names stay unique across the segment directory,
/// `tmp/` and `archives/`.
fn timed_policy(layout: &SegmentLayout, logging: &LogSettings) -> TimedRotation {
    TimedRotation::new(logging.frequency, logging.backup_count)
        .with_reserved_dirs([layout.tmp_dir(), layout.archives_dir()])
}

fn cutoff(horizon: Duration) -> SystemTime {
    SystemTime::now().checked_sub(horizon).unwrap_or(UNIX_EPOCH)
}

/// Unshipped files a previous process left behind: everything in `tmp/` and
/// every closed `*.log` in the segment directory modified before `cutoff`.
/// The active segment of this session is never included.
pub fn recovery_candidates(layout: &SegmentLayout, cutoff: SystemTime) -> Vec<PathBuf> {
    let active = layout.active_segment();

    let mut in_flight = files_modified_before(&layout.tmp_dir(), cutoff);
    in_flight.sort();

    let mut closed: Vec<PathBuf> = files_modified_before(layout.segment_dir(), cutoff)
        .into_iter()
        .filter(|path| path != &active)
        .filter(|path| path.extension().map(|ext| ext == "log").unwrap_or(false))
        .collect();
    closed.sort();

    in_flight.extend(closed);
    in_flight
}

/// Thread-safe handle to a session's segment writer.
///
/// Clones share the same segment. Writing never fails from the caller's point
/// of view: I/O problems are counted and the line is dropped.
#[derive(Clone)]
pub struct RotatingLogWriter {
    inner: Arc<WriterInner>,
}

impl RotatingLogWriter {
    /// Build the writer for `app` with time-based rotation.
    ///
    /// When shipping is enabled but no upload route can be built, the writer
    /// runs with shipping disabled. Must be called inside a tokio runtime.
    pub fn new(app: Arc<AppSettings>, logging: &LogSettings, shipping: &ShippingSettings) -> Result<Self> {
        let layout = SegmentLayout::new(&logging.directory, &app);

        let uploader = if shipping.enabled {
            match Uploader::new(app, layout.clone(), shipping) {
                Ok(uploader) => Some(uploader),
                Err(e) => {
                    counter!("skiff.shipping.failed", "kind" => e.kind()).increment(1);
                    None
                }
            }
        } else {
            None
        };

        let policy = timed_policy(&layout, logging);
        Self::with_policy(layout, Box::new(policy), logging, uploader)
    }

    /// Build a writer with an explicit policy; shipping is enabled exactly
    /// when an uploader is given.
    pub fn with_policy(
        layout: SegmentLayout,
        policy: Box<dyn RotationPolicy>,
        logging: &LogSettings,
        uploader: Option<Uploader>,
    ) -> Result<Self> {
        let shipping = uploader.is_some();
        let (queue, worker) = ShippingQueue::channel(uploader);
        Self::assemble(layout, policy, logging, shipping, queue, Some(worker))
    }

    fn assemble(
        layout: SegmentLayout,
        policy: Box<dyn RotationPolicy>,
        logging: &LogSettings,
        shipping: bool,
        queue: ShippingQueue,
        worker: Option<ShippingWorker>,
    ) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::System {
                message: "The segment writer needs a running tokio runtime".to_string(),
            });
        }

        layout.ensure_dirs()?;

        let expired = sweep(
            &[layout.archives_dir(), layout.tmp_dir()],
            cutoff(logging.expiry_horizon()),
        );

        if shipping {
            for path in recovery_candidates(&layout, cutoff(logging.recovery_horizon())) {
                queue.enqueue(QueueItem::new(path));
            }
        }

        let active = layout.active_segment();
        let file = open_segment(&active)?;
        let now = Utc::now();
        let next_rollover = policy.next_rollover(now);

        let inner = Arc::new(WriterInner {
            layout,
            shipping,
            queue,
            close_timeout: logging.close_timeout(),
            core: Mutex::new(WriterCore {
                state: WriterState::Active,
                segment: LogSegment::open(active, now),
                file: Some(file),
                policy,
                next_rollover,
                handed_off: HashSet::new(),
            }),
            background: Mutex::new(Background::default()),
        });

        let weak: Weak<WriterInner> = Arc::downgrade(&inner);
        let clock = LifecycleClock::start(logging.frequency, move |boundary| match weak.upgrade() {
            Some(inner) => {
                inner.rollover_due(boundary);
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(()),
        });

        {
            let mut background = lock(&inner.background);
            background.clock = Some(clock);
            background.worker = worker.map(ShippingWorker::spawn);
        }

        tracing::debug!(
            telemetry.event = "segment_writer_started",
            segment_dir = %inner.layout.segment_dir().display(),
            shipping = shipping,
            expired = expired.files_removed,
            "Segment writer started"
        );

        Ok(Self { inner })
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.inner.layout
    }

    pub fn shipping_enabled(&self) -> bool {
        self.inner.shipping
    }

    pub fn state(&self) -> WriterState {
        lock(&self.inner.core).state
    }

    pub fn segment(&self) -> LogSegment {
        lock(&self.inner.core).segment.clone()
    }

    /// Append one already formatted line
    pub fn write_line(&self, line: &str) {
        self.inner.append(line.as_bytes());
    }

    /// Rotate now, regardless of the policy boundary
    pub fn rollover(&self) {
        let mut core = lock(&self.inner.core);
        if core.state == WriterState::Active {
            self.inner.rotate(&mut core, Utc::now());
        }
    }

    /// Close the active segment, hand it to the worker as the last item and
    /// wait for the worker up to the close timeout.
    ///
    /// Returns the worker's summary when it finished in time. Closing twice
    /// is a no-op.
    pub async fn close(&self) -> Option<ShippingSummary> {
        let active = {
            let mut core = lock(&self.inner.core);
            if core.state != WriterState::Active {
                return None;
            }
            core.state = WriterState::Closing;
            if let Some(mut file) = core.file.take() {
                let _ = file.flush();
                let _ = file.sync_all();
            }
            core.segment.closed = true;
            core.segment.path.clone()
        };

        let (clock, worker) = {
            let mut background = lock(&self.inner.background);
            (background.clock.take(), background.worker.take())
        };
        if let Some(clock) = clock {
            clock.stop();
        }

        self.inner.queue.enqueue(QueueItem::last(active));

        let summary = match worker {
            Some(handle) => match tokio::time::timeout(self.inner.close_timeout, handle).await {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(_)) => None,
                Err(_) => {
                    counter!("skiff.shipping.abandoned").increment(1);
                    None
                }
            },
            None => None,
        };

        lock(&self.inner.core).state = WriterState::Closed;
        summary
    }
}

impl WriterInner {
    fn append(&self, buf: &[u8]) {
        let mut core = lock(&self.core);
        if core.state != WriterState::Active {
            return;
        }

        let now = Utc::now();
        if now >= core.next_rollover {
            self.rotate(&mut core, now);
        }

        if core.file.is_none() {
            match open_segment(&core.segment.path) {
                Ok(file) => core.file = Some(file),
                Err(_) => {
                    counter!("skiff.rotation.errors").increment(1);
                    return;
                }
            }
        }

        if let Some(file) = core.file.as_mut() {
            if file.write_all(buf).is_err() {
                counter!("skiff.rotation.errors").increment(1);
            }
        }
    }

    /// Clock tick for `boundary`; rotates only if the boundary is still due
    fn rollover_due(&self, boundary: DateTime<Utc>) {
        let mut core = lock(&self.core);
        if core.state == WriterState::Active && core.next_rollover <= boundary {
            self.rotate(&mut core, Utc::now().max(boundary));
        }
    }

    fn rotate(&self, core: &mut WriterCore, now: DateTime<Utc>) {
        let active = core.segment.path.clone();
        core.state = WriterState::Rotating;

        if let Some(mut file) = core.file.take() {
            let _ = file.flush();
        }

        let has_content = std::fs::metadata(&active)
            .map(|metadata| metadata.len() > 0)
            .unwrap_or(false);

        if has_content {
            let rotated = core.policy.rotated_path(&active, core.segment.created_at);
            match std::fs::rename(&active, &rotated) {
                Ok(()) => {
                    // A fresh name; any earlier hand-off under it is stale
                    core.handed_off.remove(&rotated);
                    core.segment = LogSegment::open(active.clone(), now);
                }
                Err(_) => {
                    counter!("skiff.rotation.errors").increment(1);
                }
            }
        } else {
            core.segment.created_at = now;
        }

        match open_segment(&active) {
            Ok(file) => core.file = Some(file),
            Err(_) => counter!("skiff.rotation.errors").increment(1),
        }
        core.next_rollover = core.policy.next_rollover(now);

        match core.policy.files_to_delete(&active) {
            Ok(expired) => {
                core.handed_off.retain(|path| path.exists());
                for path in expired {
                    self.release(core, path);
                }
            }
            Err(_) => counter!("skiff.rotation.errors").increment(1),
        }

        core.state = WriterState::Active;
    }

    /// A closed segment leaves local retention
    fn release(&self, core: &mut WriterCore, path: PathBuf) {
        if self.shipping {
            if core.handed_off.contains(&path) {
                return;
            }
            if self.queue.enqueue(QueueItem::new(path.clone())) {
                core.handed_off.insert(path);
            } else {
                // Left in place; the next rollover offers it again
                counter!("skiff.shipping.failed", "kind" => "queue_closed").increment(1);
            }
        } else if std::fs::remove_file(&path).is_err() {
            counter!("skiff.rotation.errors").increment(1);
        }
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut core = lock(&self.inner.core);
        if let Some(file) = core.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RotatingLogWriter {
    type Writer = RotatingLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::RotationFrequency;
    use tempfile::TempDir;

    fn app() -> Arc<AppSettings> {
        Arc::new(AppSettings::new("skiff", "c0ffee", "sess", "inst"))
    }

    fn logging(root: &Path, backup_count: u32) -> LogSettings {
        LogSettings {
            directory: root.to_path_buf(),
            backup_count,
            ..Default::default()
        }
    }

    fn closed_segments(layout: &SegmentLayout) -> Vec<PathBuf> {
        let active = layout.active_segment();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(layout.segment_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_file() && path != &active)
            .collect();
        paths.sort();
        paths
    }

    /// Writer with shipping switched on and the worker kept by the test
    fn shipping_writer(root: &Path, backup_count: u32) -> (RotatingLogWriter, ShippingWorker) {
        let app = app();
        let layout = SegmentLayout::new(root, &app);
        let settings = logging(root, backup_count);
        let policy = timed_policy(&layout, &settings);
        let (queue, worker) = ShippingQueue::channel(None);
        let writer = RotatingLogWriter::assemble(
            layout,
            Box::new(policy),
            &settings,
            true,
            queue,
            None,
        )
        .unwrap();
        (writer, worker)
    }

    #[test]
    fn test_requires_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let result = RotatingLogWriter::new(
            app(),
            &logging(temp_dir.path(), 0),
            &ShippingSettings::default(),
        );
        assert!(matches!(result, Err(Error::System { .. })));
    }

    #[tokio::test]
    async fn test_writes_land_in_active_segment() {
        let temp_dir = TempDir::new().unwrap();
        let writer =
            RotatingLogWriter::new(app(), &logging(temp_dir.path(), 0), &ShippingSettings::default())
                .unwrap();

        writer.write_line("one\n");
        writer.write_line("two\n");

        let active = writer.layout().active_segment();
        assert_eq!(active, temp_dir.path().join("inst").join("skiff_sess.log"));
        assert_eq!(std::fs::read_to_string(&active).unwrap(), "one\ntwo\n");
        assert!(!writer.shipping_enabled());
        assert_eq!(writer.state(), WriterState::Active);

        writer.close().await;
    }

    #[tokio::test]
    async fn test_rollover_without_shipping_deletes_beyond_backups() {
        let temp_dir = TempDir::new().unwrap();
        let writer =
            RotatingLogWriter::new(app(), &logging(temp_dir.path(), 1), &ShippingSettings::default())
                .unwrap();

        writer.write_line("first\n");
        writer.rollover();
        assert_eq!(closed_segments(writer.layout()).len(), 1);

        writer.write_line("second\n");
        writer.rollover();
        let closed = closed_segments(writer.layout());
        assert_eq!(closed.len(), 1);
        assert_eq!(std::fs::read_to_string(&closed[0]).unwrap(), "second\n");

        let active = writer.layout().active_segment();
        assert!(active.exists());
        assert_eq!(std::fs::read_to_string(&active).unwrap(), "");

        writer.close().await;
    }

    #[tokio::test]
    async fn test_rollover_of_empty_segment_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let writer =
            RotatingLogWriter::new(app(), &logging(temp_dir.path(), 5), &ShippingSettings::default())
                .unwrap();

        writer.rollover();
        writer.rollover();
        assert!(closed_segments(writer.layout()).is_empty());

        writer.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_later_writes() {
        let temp_dir = TempDir::new().unwrap();
        let writer =
            RotatingLogWriter::new(app(), &logging(temp_dir.path(), 0), &ShippingSettings::default())
                .unwrap();
        writer.write_line("kept\n");

        let summary = writer.close().await;
        assert_eq!(summary.map(|s| s.processed), Some(1));
        assert_eq!(writer.state(), WriterState::Closed);
        assert!(writer.segment().closed);

        writer.write_line("dropped\n");
        writer.rollover();
        assert!(writer.close().await.is_none());

        let active = writer.layout().active_segment();
        assert_eq!(std::fs::read_to_string(active).unwrap(), "kept\n");
    }

    #[tokio::test]
    async fn test_released_segments_are_forwarded_exactly_once() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, mut worker) = shipping_writer(temp_dir.path(), 1);

        for round in 0..4 {
            writer.write_line(&format!("round {}\n", round));
            writer.rollover();
        }

        let forwarded = worker.drain();
        let unique: HashSet<&PathBuf> = forwarded.iter().map(|item| &item.path).collect();
        assert_eq!(forwarded.len(), 3);
        assert_eq!(unique.len(), 3);
        assert!(forwarded.iter().all(|item| !item.last));
        assert!(!unique.contains(&writer.layout().active_segment()));

        // Nothing was deleted: the worker owns the forwarded files.
        assert_eq!(closed_segments(writer.layout()).len(), 4);

        writer.close().await;
        let last = worker.drain();
        assert_eq!(last, vec![QueueItem::last(writer.layout().active_segment())]);
    }

    #[tokio::test]
    async fn test_recovery_enqueues_leftovers_before_new_work() {
        let temp_dir = TempDir::new().unwrap();
        let app = app();
        let layout = SegmentLayout::new(temp_dir.path(), &app);
        layout.ensure_dirs().unwrap();

        let in_flight = layout.tmp_dir().join("skiff_old.log");
        let leftover = layout.segment_dir().join("skiff_old.2024-05-01_10.log");
        let unrelated = layout.segment_dir().join("notes.txt");
        for path in [&in_flight, &leftover, &unrelated] {
            std::fs::write(path, "line\n").unwrap();
        }

        let settings = LogSettings {
            recovery_horizon_days: 0,
            ..logging(temp_dir.path(), 0)
        };
        let (queue, mut worker) = ShippingQueue::channel(None);
        let writer = RotatingLogWriter::assemble(
            layout,
            Box::new(TimedRotation::new(RotationFrequency::Hour, 0)),
            &settings,
            true,
            queue,
            None,
        )
        .unwrap();

        let recovered: Vec<PathBuf> = worker.drain().into_iter().map(|item| item.path).collect();
        assert_eq!(recovered, vec![in_flight, leftover]);

        writer.close().await;
    }

    #[tokio::test]
    async fn test_rollovers_within_one_interval_get_distinct_names() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, mut worker) = shipping_writer(temp_dir.path(), 0);
        let tmp = writer.layout().tmp_dir();

        writer.write_line("segment one\n");
        writer.rollover();
        let first = worker.drain();
        assert_eq!(first.len(), 1);

        // The worker claims the first segment before the next rollover.
        let claimed = tmp.join(first[0].path.file_name().unwrap());
        std::fs::rename(&first[0].path, &claimed).unwrap();

        writer.write_line("segment two\n");
        writer.rollover();
        let second = worker.drain();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].path.file_name(), first[0].path.file_name());
        assert!(!tmp.join(second[0].path.file_name().unwrap()).exists());
        assert_eq!(std::fs::read_to_string(&second[0].path).unwrap(), "segment two\n");
        assert_eq!(std::fs::read_to_string(&claimed).unwrap(), "segment one\n");

        writer.close().await;
    }

    #[tokio::test]
    async fn test_closed_queue_keeps_segment_for_next_rollover() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, worker) = shipping_writer(temp_dir.path(), 0);
        drop(worker);

        writer.write_line("stranded\n");
        writer.rollover();

        let closed = closed_segments(writer.layout());
        assert_eq!(closed.len(), 1);
        assert_eq!(std::fs::read_to_string(&closed[0]).unwrap(), "stranded\n");
        assert!(lock(&writer.inner.core).handed_off.is_empty());
        assert_eq!(writer.state(), WriterState::Active);

        writer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_tick_rotates_idle_writer() {
        let temp_dir = TempDir::new().unwrap();
        let settings = LogSettings {
            frequency: RotationFrequency::Minute,
            ..logging(temp_dir.path(), 5)
        };
        let writer = RotatingLogWriter::new(app(), &settings, &ShippingSettings::default()).unwrap();

        writer.write_line("before the tick\n");
        tokio::time::sleep(Duration::from_secs(61)).await;

        let closed = closed_segments(writer.layout());
        assert_eq!(closed.len(), 1);
        assert_eq!(std::fs::read_to_string(&closed[0]).unwrap(), "before the tick\n");
        let active = writer.layout().active_segment();
        assert_eq!(std::fs::read_to_string(active).unwrap(), "");

        writer.close().await;
    }
}
