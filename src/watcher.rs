//! File-change watcher for credential files.
//!
//! [`FileWatcher`] tracks a set of files and emits a [`FileWatcherEvent`]
//! whenever one of them is created, written or replaced. It combines two
//! sources:
//!
//! - OS notifications from `notify` (inotify on Linux) on the parent
//!   directory of every tracked file, classified as
//!   `create | write | remove | rename | other`;
//! - a reconcile tick (default 200 ms) that stats every tracked file,
//!   re-adds its directory to the OS watcher and emits when its mtime or
//!   inode moved.
//!
//! Watching the directory rather than the file keeps notifications flowing
//! when a file is replaced by `rename(2)` or deleted and recreated, since the
//! watch is not tied to the old inode. The tick catches what notifications
//! miss, and recovers the watch when the directory itself is recreated.
//!
//! [`RateLimitedWatcher`] wraps a [`FileWatcher`] and coalesces bursts into
//! one event per window.
//!
//! # Ordering
//!
//! A single task produces every event, so emissions follow observation
//! order. The events channel closes once that task returns, either because
//! the start context was cancelled or because `stop` was called. After
//! `stop` returns nothing more is emitted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Default interval of the reconcile tick.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(200);

const EVENTS_CAPACITY: usize = 16;

/// Files whose content or identity changed since the last emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWatcherEvent {
    /// Changed files, in observation order
    pub filenames: Vec<PathBuf>,
}

/// How a notification is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Create,
    Write,
    Remove,
    Rename,
    Other,
}

fn classify(kind: &EventKind) -> Change {
    match kind {
        EventKind::Create(_) => Change::Create,
        EventKind::Remove(_) => Change::Remove,
        EventKind::Modify(ModifyKind::Name(_)) => Change::Rename,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => Change::Write,
        _ => Change::Other,
    }
}

/// What a reconcile compares: mtime plus, on unix, the inode number.
type Stamp = (SystemTime, u64);

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

fn stamp(path: &Path) -> Option<Stamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, inode(&meta)))
}

/// State shared between the public handle and the watch loop.
struct Tracked {
    /// path → last observed stamp; `None` means "unknown", so any stat differs
    files: RwLock<BTreeMap<PathBuf, Option<Stamp>>>,
    os: Mutex<RecommendedWatcher>,
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|dir| !dir.as_os_str().is_empty())
}

impl Tracked {
    /// Watch the directory holding `path`.
    fn watch(&self, path: &Path) {
        let Some(dir) = parent_dir(path) else {
            return;
        };
        if let Err(e) = self.os.lock().watch(dir, RecursiveMode::NonRecursive) {
            debug!(dir = %dir.display(), error = %e, "Cannot watch directory yet");
        }
    }

    /// Drop the directory watch for `path` unless another tracked file needs it.
    fn unwatch(&self, path: &Path, files: &BTreeMap<PathBuf, Option<Stamp>>) {
        let Some(dir) = parent_dir(path) else {
            return;
        };
        if files.keys().any(|other| parent_dir(other) == Some(dir)) {
            return;
        }
        let _ = self.os.lock().unwatch(dir);
    }

    /// Stat every tracked file and return those whose stamp moved.
    ///
    /// Holds the write lock for the whole scan.
    fn reconcile(&self) -> Vec<PathBuf> {
        let mut files = self.files.write();
        let mut changed = Vec::new();
        for (path, seen) in files.iter_mut() {
            let Some(current) = stamp(path) else {
                continue;
            };
            self.watch(path);
            if *seen != Some(current) {
                *seen = Some(current);
                changed.push(path.clone());
            }
        }
        changed
    }

    fn on_event(&self, event: &Event) -> Vec<PathBuf> {
        let change = classify(&event.kind);
        if change == Change::Other {
            return Vec::new();
        }

        let mut files = self.files.write();
        let tracked: Vec<PathBuf> = event
            .paths
            .iter()
            .filter(|p| files.contains_key(p.as_path()))
            .cloned()
            .collect();
        if tracked.is_empty() {
            return Vec::new();
        }
        debug!(paths = ?tracked, kind = ?event.kind, "Watched file changed");

        // The removed inode is gone; whatever now sits at the path is found
        // by comparing stamps, so a replacement the tick already saw is not
        // reported twice.
        if change == Change::Remove {
            drop(files);
            return self.reconcile();
        }

        // A rename is reported once per side of the move, so only a path
        // whose stamp actually moved is emitted for it.
        let mut changed = Vec::new();
        for path in tracked {
            let current = stamp(&path);
            let previous = files.insert(path.clone(), current);
            if change != Change::Rename || previous != Some(current) {
                changed.push(path);
            }
        }
        changed
    }
}

/// Watches individual files for changes.
pub struct FileWatcher {
    tracked: Arc<Tracked>,
    raw_rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Result<Event>>>>,
    events_tx: Mutex<Option<mpsc::Sender<FileWatcherEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<FileWatcherEvent>>>,
    reconcile_interval: Duration,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    /// Create a watcher with the default reconcile interval.
    pub fn new() -> Result<Self> {
        Self::with_reconcile_interval(DEFAULT_RECONCILE_INTERVAL)
    }

    /// Create a watcher with a custom reconcile interval.
    pub fn with_reconcile_interval(reconcile_interval: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let os = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = raw_tx.send(result);
            },
            NotifyConfig::default(),
        )?;
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);

        Ok(Self {
            tracked: Arc::new(Tracked {
                files: RwLock::new(BTreeMap::new()),
                os: Mutex::new(os),
            }),
            raw_rx: Mutex::new(Some(raw_rx)),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            reconcile_interval,
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Start tracking `path`. The file does not have to exist yet.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = std::path::absolute(path.as_ref())?;
        let mut files = self.tracked.files.write();
        files.insert(path.clone(), stamp(&path));
        self.tracked.watch(&path);
        debug!(path = %path.display(), "Tracking file");
        Ok(())
    }

    /// Stop tracking `path`.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = std::path::absolute(path.as_ref())?;
        let mut files = self.tracked.files.write();
        if files.remove(&path).is_some() {
            self.tracked.unwatch(&path, &files);
        }
        Ok(())
    }

    /// Swap one tracked path for another.
    pub fn replace(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        self.remove(old)?;
        self.add(new)
    }

    /// Currently tracked paths.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.tracked.files.read().keys().cloned().collect()
    }

    /// Take the events channel. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::Receiver<FileWatcherEvent>> {
        self.events_rx.lock().take()
    }

    /// Spawn the watch loop. It runs until `ctx` is cancelled or [`stop`](Self::stop) is called.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let (Some(raw_rx), Some(events_tx)) = (self.raw_rx.lock().take(), self.events_tx.lock().take())
        else {
            return Err(Error::Watcher("watcher already started".to_string()));
        };

        let handle = tokio::spawn(watch_loop(
            Arc::clone(&self.tracked),
            raw_rx,
            events_tx,
            self.reconcile_interval,
            ctx.clone(),
            self.stop.clone(),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the watch loop and wait for it to exit. Later calls are no-ops.
    ///
    /// The events channel closes even if the watcher was never started.
    pub async fn stop(&self) {
        self.stop.cancel();
        drop(self.events_tx.lock().take());
        drop(self.raw_rx.lock().take());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "File watcher task failed");
            }
        }
    }
}

async fn watch_loop(
    tracked: Arc<Tracked>,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    events_tx: mpsc::Sender<FileWatcherEvent>,
    reconcile_interval: Duration,
    ctx: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + reconcile_interval, reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'watch: loop {
        let changed = tokio::select! {
            () = ctx.cancelled() => break,
            () = stop.cancelled() => break,
            Some(result) = raw_rx.recv() => match result {
                Ok(event) => tracked.on_event(&event),
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                    continue;
                }
            },
            _ = ticker.tick() => tracked.reconcile(),
        };

        for path in changed {
            let event = FileWatcherEvent {
                filenames: vec![path],
            };
            tokio::select! {
                () = ctx.cancelled() => break 'watch,
                () = stop.cancelled() => break 'watch,
                sent = events_tx.send(event) => {
                    if sent.is_err() {
                        debug!("Events receiver dropped");
                        break 'watch;
                    }
                }
            }
        }
    }
    debug!("File watcher loop exited");
}

/// Coalesce events arriving within `interval` of the first one in a window.
///
/// The window opens on the first event and is not extended by later ones.
/// When the input closes any buffered paths are flushed as a final event
/// before the output closes. Cancelling `ctx` drops the buffer.
pub fn coalesce(
    mut input: mpsc::Receiver<FileWatcherEvent>,
    interval: Duration,
    ctx: CancellationToken,
) -> (mpsc::Receiver<FileWatcherEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENTS_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut buffer: Vec<PathBuf> = Vec::new();
        let timer = tokio::time::sleep(interval);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                received = input.recv() => match received {
                    Some(event) => {
                        if !armed {
                            timer.as_mut().reset(Instant::now() + interval);
                            armed = true;
                        }
                        buffer.extend(event.filenames);
                    }
                    None => {
                        if !buffer.is_empty() {
                            let _ = tx.send(FileWatcherEvent { filenames: std::mem::take(&mut buffer) }).await;
                        }
                        break;
                    }
                },
                () = &mut timer, if armed => {
                    armed = false;
                    if !buffer.is_empty() {
                        let event = FileWatcherEvent { filenames: std::mem::take(&mut buffer) };
                        tokio::select! {
                            () = ctx.cancelled() => break,
                            sent = tx.send(event) => if sent.is_err() { break },
                        }
                    }
                }
            }
        }
        debug!("Coalescer exited");
    });
    (rx, handle)
}

/// A [`FileWatcher`] whose events are coalesced per window.
pub struct RateLimitedWatcher {
    inner: FileWatcher,
    interval: Duration,
    events_rx: Mutex<Option<mpsc::Receiver<FileWatcherEvent>>>,
    coalescer: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitedWatcher {
    /// Wrap `inner`, coalescing its events over `interval`.
    #[must_use]
    pub fn new(inner: FileWatcher, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            events_rx: Mutex::new(None),
            coalescer: Mutex::new(None),
        }
    }

    /// Start tracking `path`.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.add(path)
    }

    /// Stop tracking `path`.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.remove(path)
    }

    /// Swap one tracked path for another.
    pub fn replace(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        self.inner.replace(old, new)
    }

    /// Start the inner watcher and the coalescer.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let input = self
            .inner
            .events()
            .ok_or_else(|| Error::Watcher("watcher already started".to_string()))?;
        self.inner.start(ctx)?;
        let (rx, handle) = coalesce(input, self.interval, ctx.clone());
        *self.events_rx.lock() = Some(rx);
        *self.coalescer.lock() = Some(handle);
        Ok(())
    }

    /// Take the coalesced events channel (available after [`start`](Self::start)).
    pub fn events(&self) -> Option<mpsc::Receiver<FileWatcherEvent>> {
        self.events_rx.lock().take()
    }

    /// Stop both tasks; buffered paths are flushed first. Later calls are no-ops.
    pub async fn stop(&self) {
        self.inner.stop().await;
        let handle = self.coalescer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Coalescer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    fn event(name: &str) -> FileWatcherEvent {
        FileWatcherEvent {
            filenames: vec![PathBuf::from(name)],
        }
    }

    #[test]
    fn classification_covers_actionable_kinds() {
        use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

        assert_eq!(classify(&EventKind::Create(CreateKind::File)), Change::Create);
        assert_eq!(classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))), Change::Write);
        assert_eq!(classify(&EventKind::Modify(ModifyKind::Any)), Change::Write);
        assert_eq!(classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))), Change::Rename);
        assert_eq!(classify(&EventKind::Remove(RemoveKind::File)), Change::Remove);
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            Change::Other
        );
        assert_eq!(classify(&EventKind::Access(AccessKind::Any)), Change::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_into_one_event_in_arrival_order() {
        // GIVEN: a coalescer with a 1s window
        let (tx, rx) = mpsc::channel(8);
        let (mut out, _task) = coalesce(rx, Duration::from_secs(1), CancellationToken::new());

        // WHEN: three events arrive inside the window
        tx.send(event("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(event("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(event("c")).await.unwrap();

        // THEN: exactly one event with all three paths
        let got = out.recv().await.unwrap();
        assert_eq!(got.filenames, vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]);
        assert!(timeout(Duration::from_secs(5), out.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_not_extended_by_later_events() {
        // GIVEN: a 1s window opened at t=0
        let (tx, rx) = mpsc::channel(8);
        let (mut out, _task) = coalesce(rx, Duration::from_secs(1), CancellationToken::new());
        let started = Instant::now();
        tx.send(event("a")).await.unwrap();

        // WHEN: another event arrives at t=0.9s
        tokio::time::sleep(Duration::from_millis(900)).await;
        tx.send(event("b")).await.unwrap();

        // THEN: the flush still happens at t=1s, not t=1.9s
        let got = out.recv().await.unwrap();
        assert_eq!(got.filenames.len(), 2);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_input_flushes_the_buffer_then_closes_output() {
        let (tx, rx) = mpsc::channel(8);
        let (mut out, task) = coalesce(rx, Duration::from_secs(60), CancellationToken::new());

        tx.send(event("a")).await.unwrap();
        drop(tx);

        assert_eq!(out.recv().await.unwrap().filenames, vec![PathBuf::from("a")]);
        assert!(out.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_output_without_flushing() {
        let (tx, rx) = mpsc::channel(8);
        let ctx = CancellationToken::new();
        let (mut out, _task) = coalesce(rx, Duration::from_secs(60), ctx.clone());

        tx.send(event("a")).await.unwrap();
        tokio::task::yield_now().await;
        ctx.cancel();

        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_to_tracked_file_is_emitted() {
        // GIVEN: a started watcher tracking one file
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "one").unwrap();
        let watcher = FileWatcher::new().unwrap();
        watcher.add(&file).unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(&CancellationToken::new()).unwrap();

        // WHEN: the file is rewritten
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&file, "two").unwrap();

        // THEN: an event names the file
        let got = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(got.filenames, vec![std::path::absolute(&file).unwrap()]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn file_created_after_add_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("late");
        let watcher = FileWatcher::new().unwrap();
        watcher.add(&file).unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(&CancellationToken::new()).unwrap();

        std::fs::write(&file, "hello").unwrap();

        let got = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(got.filenames, vec![std::path::absolute(&file).unwrap()]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_the_events_channel_and_is_idempotent() {
        let watcher = FileWatcher::new().unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(&CancellationToken::new()).unwrap();

        watcher.stop().await;
        watcher.stop().await;

        assert!(events.recv().await.is_none());
    }

    /// Test stopping a watcher that never started still closes its channel
    #[tokio::test]
    async fn test_stop_without_start_closes_the_events_channel() {
        let watcher = FileWatcher::new().unwrap();
        let mut events = watcher.events().unwrap();

        watcher.stop().await;

        assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());
        assert!(matches!(
            watcher.start(&CancellationToken::new()),
            Err(Error::Watcher(_))
        ));
    }

    /// Test replacements are seen through the directory watch alone
    #[tokio::test]
    async fn test_directory_watch_reports_replacements_without_the_tick() {
        // GIVEN: a watcher whose reconcile tick never fires during the test
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        let staged = dir.path().join("token.new");
        std::fs::write(&file, "one").unwrap();
        let watcher = FileWatcher::with_reconcile_interval(Duration::from_secs(3600)).unwrap();
        watcher.add(&file).unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(&CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let expected = vec![std::path::absolute(&file).unwrap()];

        // WHEN: the file is replaced by rename
        std::fs::write(&staged, "two").unwrap();
        std::fs::rename(&staged, &file).unwrap();

        // THEN: the notification names the tracked file
        let got = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(got.filenames, expected);

        // WHEN: it is deleted and recreated
        std::fs::remove_file(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while events.try_recv().is_ok() {}
        std::fs::write(&file, "three").unwrap();

        // THEN: the recreated file is reported too
        let got = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(got.filenames, expected);
        watcher.stop().await;
    }

    /// Test writes to untracked neighbours are ignored
    #[tokio::test]
    async fn test_untracked_sibling_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "one").unwrap();
        let watcher = FileWatcher::new().unwrap();
        watcher.add(&file).unwrap();
        let mut events = watcher.events().unwrap();
        watcher.start(&CancellationToken::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::write(dir.path().join("other"), "noise").unwrap();

        assert!(timeout(Duration::from_millis(500), events.recv()).await.is_err());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn cancelling_the_context_closes_the_events_channel() {
        let watcher = FileWatcher::new().unwrap();
        let mut events = watcher.events().unwrap();
        let ctx = CancellationToken::new();
        watcher.start(&ctx).unwrap();

        ctx.cancel();

        assert!(timeout(Duration::from_secs(2), events.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let watcher = FileWatcher::new().unwrap();
        let ctx = CancellationToken::new();
        watcher.start(&ctx).unwrap();
        assert!(matches!(watcher.start(&ctx), Err(Error::Watcher(_))));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn replace_swaps_tracked_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let watcher = FileWatcher::new().unwrap();
        watcher.add(&a).unwrap();

        watcher.replace(&a, &b).unwrap();

        assert_eq!(watcher.paths(), vec![std::path::absolute(&b).unwrap()]);
    }
}
