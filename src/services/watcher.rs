//! Event sources feeding the dispatcher
//!
//! Notify mode bridges OS filesystem events into a bounded channel. When the
//! channel overflows, the dropped events are replaced by one full scan, so a
//! burst never loses a file. Poll mode walks the watch root on a timer.
//! Either way every candidate path goes to [`Dispatcher::submit`]; dedupe and
//! the in-flight set absorb the repeats.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::file_utils::is_sample_dir;
use super::manager::{Service, ServiceHealth};
use super::queues::{Dispatcher, SubmitOutcome};
use crate::config::{Config, WatchMode};

/// Capacity of the notify bridge before events spill into a rescan
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Moved,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Map a raw notify event onto the events the pipeline cares about.
///
/// Renames report the destination. Removals, reads and metadata-only changes
/// are dropped. A close-after-write counts as a modification.
pub fn translate(event: notify::Event) -> Vec<WatchEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Moved,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            return event
                .paths
                .last()
                .map(|to| vec![WatchEvent::new(WatchEventKind::Moved, to.clone())])
                .unwrap_or_default();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => WatchEventKind::Moved,
        EventKind::Modify(ModifyKind::Name(_)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => WatchEventKind::Modified,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchEventKind::Modified,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .map(|path| WatchEvent::new(kind, path))
        .collect()
}

/// OS notification watcher bridged into tokio
pub struct NotifyWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<WatchEvent>,
    overflowed: Arc<AtomicBool>,
}

impl NotifyWatcher {
    pub fn start(root: &Path, recursive: bool) -> Result<Self> {
        Self::with_capacity(root, recursive, EVENT_BUFFER)
    }

    pub fn with_capacity(root: &Path, recursive: bool, capacity: usize) -> Result<Self> {
        let (tx, events) = mpsc::channel(capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));
        let flag = overflowed.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for watch_event in translate(event) {
                        match tx.try_send(watch_event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(dropped)) => {
                                if !flag.swap(true, Ordering::SeqCst) {
                                    warn!(
                                        path = %dropped.path.display(),
                                        "Watch event buffer full, scheduling rescan"
                                    );
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Filesystem watch error");
                    flag.store(true, Ordering::SeqCst);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(root, mode)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            events,
            overflowed,
        })
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Whether events were dropped since the last call
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::SeqCst)
    }
}

/// Walk of the watch folder, optionally depth-limited
#[derive(Debug, Clone)]
pub struct PollScanner {
    root: PathBuf,
    /// Walk depth counted from the root; files directly in it are depth 1.
    /// `None` walks the whole tree.
    max_depth: Option<usize>,
    skip_samples: bool,
}

impl PollScanner {
    pub fn new(root: impl Into<PathBuf>, max_depth: usize, skip_samples: bool) -> Self {
        Self {
            root: root.into(),
            max_depth: Some(max_depth.max(1)),
            skip_samples,
        }
    }

    /// Whole-tree walk, for a recursive native watch
    pub fn unbounded(root: impl Into<PathBuf>, skip_samples: bool) -> Self {
        Self {
            root: root.into(),
            max_depth: None,
            skip_samples,
        }
    }

    /// `MAX_SUBFOLDER_DEPTH` bounds poll mode only. A recursive notify watch
    /// reports events at any depth, and its scans cover the same tree.
    pub fn from_config(config: &Config) -> Self {
        let root = &config.watch_folder;
        match (config.scan_subfolders, config.watch_mode) {
            (false, _) => Self::new(root, 1, config.skip_samples),
            (true, WatchMode::Notify) => Self::unbounded(root, config.skip_samples),
            (true, WatchMode::Poll) => {
                Self::new(root, config.max_subfolder_depth + 1, config.skip_samples)
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn depth_of(&self, path: &Path) -> Option<usize> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.components().count())
    }

    /// Whether a file at `path` is inside the watched depth
    pub fn accepts(&self, path: &Path) -> bool {
        match self.depth_of(path) {
            Some(depth) if depth >= 1 => self.max_depth.is_none_or(|max| depth <= max),
            _ => false,
        }
    }

    /// Every file under the root within the depth limit
    pub fn scan(&self) -> Vec<PathBuf> {
        self.scan_dir(&self.root)
    }

    /// Files under `dir`, still bounded by the depth limit from the root
    pub fn scan_dir(&self, dir: &Path) -> Vec<PathBuf> {
        let Some(base) = self.depth_of(dir) else {
            return Vec::new();
        };

        let mut walker = WalkDir::new(dir);
        if let Some(max) = self.max_depth {
            if base >= max {
                return Vec::new();
            }
            walker = walker.max_depth(max - base);
        }

        let skip_samples = self.skip_samples;
        walker
            .into_iter()
            .filter_entry(move |entry| {
                !(skip_samples
                    && entry.depth() > 0
                    && entry.file_type().is_dir()
                    && is_sample_dir(&entry.file_name().to_string_lossy()))
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }

    /// [`scan_dir`](Self::scan_dir) off the async runtime
    pub async fn scan_dir_blocking(&self, dir: &Path) -> Vec<PathBuf> {
        let scanner = self.clone();
        let dir = dir.to_path_buf();
        match tokio::task::spawn_blocking(move || scanner.scan_dir(&dir)).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "Scan task failed");
                Vec::new()
            }
        }
    }
}

/// Counts from one batch of submissions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSummary {
    pub queued: usize,
    pub skipped: usize,
}

fn submit_all(dispatcher: &Dispatcher, paths: &[PathBuf]) -> SubmitSummary {
    let mut summary = SubmitSummary::default();
    for path in paths {
        match dispatcher.submit(path) {
            SubmitOutcome::Queued => summary.queued += 1,
            _ => summary.skipped += 1,
        }
    }
    summary
}

/// Forward one event. Directories (a release folder moved in) are expanded.
async fn forward(dispatcher: &Dispatcher, scanner: &PollScanner, event: WatchEvent) {
    let is_dir = tokio::fs::metadata(&event.path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if is_dir {
        if matches!(event.kind, WatchEventKind::Created | WatchEventKind::Moved) {
            let files = scanner.scan_dir_blocking(&event.path).await;
            let summary = submit_all(dispatcher, &files);
            debug!(
                path = %event.path.display(),
                queued = summary.queued,
                "Scanned new directory"
            );
        }
        return;
    }

    if !scanner.accepts(&event.path) {
        return;
    }

    let outcome = dispatcher.submit(&event.path);
    debug!(
        path = %event.path.display(),
        kind = ?event.kind,
        outcome = ?outcome,
        "Watch event"
    );
}

async fn full_scan(dispatcher: &Dispatcher, scanner: &PollScanner, reason: &'static str) {
    let files = scanner.scan_dir_blocking(scanner.root()).await;
    let summary = submit_all(dispatcher, &files);
    debug!(
        reason,
        found = files.len(),
        queued = summary.queued,
        skipped = summary.skipped,
        "Scan complete"
    );
}

async fn notify_loop(
    mut watcher: NotifyWatcher,
    dispatcher: Dispatcher,
    scanner: PollScanner,
    cancel: CancellationToken,
) {
    full_scan(&dispatcher, &scanner, "startup").await;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = watcher.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        forward(&dispatcher, &scanner, event).await;

        if watcher.take_overflow() {
            full_scan(&dispatcher, &scanner, "overflow").await;
        }
    }
}

async fn poll_loop(
    dispatcher: Dispatcher,
    scanner: PollScanner,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => full_scan(&dispatcher, &scanner, "poll").await,
        }
    }
}

struct WatcherRuntime {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WatcherRuntime {
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Runs the configured event source and pumps it into the dispatcher
pub struct WatcherService {
    mode: WatchMode,
    recursive: bool,
    scan_interval: Duration,
    scanner: PollScanner,
    dispatcher: Dispatcher,
    runtime: RwLock<Option<WatcherRuntime>>,
}

impl WatcherService {
    pub fn new(config: &Config, dispatcher: Dispatcher) -> Self {
        Self {
            mode: config.watch_mode,
            recursive: config.scan_subfolders,
            scan_interval: config.scan_interval,
            scanner: PollScanner::from_config(config),
            dispatcher,
            runtime: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Service for WatcherService {
    fn name(&self) -> &str {
        "watcher"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["ingest".to_string()]
    }

    async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.write().await;
        if runtime.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let root = self.scanner.root().to_path_buf();
        let handle = match self.mode {
            WatchMode::Notify => {
                let watcher = NotifyWatcher::start(&root, self.recursive)?;
                tokio::spawn(notify_loop(
                    watcher,
                    self.dispatcher.clone(),
                    self.scanner.clone(),
                    cancel.clone(),
                ))
            }
            WatchMode::Poll => tokio::spawn(poll_loop(
                self.dispatcher.clone(),
                self.scanner.clone(),
                self.scan_interval,
                cancel.clone(),
            )),
        };

        info!(
            service = "watcher",
            mode = ?self.mode,
            root = %root.display(),
            recursive = self.recursive,
            "Watching for new media"
        );
        *runtime = Some(WatcherRuntime { cancel, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.shutdown().await;
            info!(service = "watcher", "Watcher stopped");
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match self.runtime.read().await.as_ref() {
            Some(runtime) if runtime.handle.is_finished() => {
                Ok(ServiceHealth::unhealthy("event loop exited"))
            }
            Some(_) => Ok(ServiceHealth::healthy()),
            None => Ok(ServiceHealth::degraded("not started")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use std::fs;
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_translate() {
        assert_eq!(
            translate(event(EventKind::Create(CreateKind::File), &["/w/a.mkv"])),
            vec![WatchEvent::new(WatchEventKind::Created, "/w/a.mkv")]
        );
        assert_eq!(
            translate(event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/w/a.mkv.part", "/w/a.mkv"]
            )),
            vec![WatchEvent::new(WatchEventKind::Moved, "/w/a.mkv")]
        );
        assert!(
            translate(event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/w/a.mkv"]
            ))
            .is_empty()
        );
        assert_eq!(
            translate(event(
                EventKind::Access(AccessKind::Close(AccessMode::Write)),
                &["/w/a.mkv"]
            ))[0]
                .kind,
            WatchEventKind::Modified
        );
        assert!(
            translate(event(
                EventKind::Remove(notify::event::RemoveKind::File),
                &["/w/a.mkv"]
            ))
            .is_empty()
        );
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Release/Sample")).unwrap();
        fs::create_dir_all(root.join("Deep/One/Two")).unwrap();
        fs::write(root.join("top.mkv"), b"x").unwrap();
        fs::write(root.join("Release/show.mkv"), b"x").unwrap();
        fs::write(root.join("Release/Sample/show-sample.mkv"), b"x").unwrap();
        fs::write(root.join("Deep/One/Two/buried.mkv"), b"x").unwrap();
        dir
    }

    fn names(mut paths: Vec<PathBuf>) -> Vec<String> {
        paths.sort();
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_scan_respects_depth_and_samples() {
        let dir = tree();

        let scanner = PollScanner::new(dir.path(), 2, true);
        assert_eq!(names(scanner.scan()), vec!["show.mkv", "top.mkv"]);

        let flat = PollScanner::new(dir.path(), 1, true);
        assert_eq!(names(flat.scan()), vec!["top.mkv"]);

        let everything = PollScanner::new(dir.path(), 8, false);
        assert_eq!(everything.scan().len(), 4);
    }

    #[test]
    fn test_scan_dir_keeps_root_relative_limit() {
        let dir = tree();
        let scanner = PollScanner::new(dir.path(), 2, true);

        assert_eq!(names(scanner.scan_dir(&dir.path().join("Release"))), vec!["show.mkv"]);
        assert!(scanner.scan_dir(&dir.path().join("Deep/One")).is_empty());
        assert!(scanner.scan_dir(Path::new("/elsewhere")).is_empty());

        assert!(scanner.accepts(&dir.path().join("Release/show.mkv")));
        assert!(!scanner.accepts(&dir.path().join("Deep/One/Two/buried.mkv")));
        assert!(!scanner.accepts(dir.path()));
    }

    fn config_for(root: &Path, mode: WatchMode) -> Config {
        Config {
            watch_folder: root.to_path_buf(),
            watch_mode: mode,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_notify_mode_forwards_files_at_any_depth() {
        let dir = tree();
        let scanner = PollScanner::from_config(&config_for(dir.path(), WatchMode::Notify));
        let (dispatcher, rx) = Dispatcher::new(Duration::from_secs(30));

        let buried = dir.path().join("Deep/One/Two/buried.mkv");
        assert!(scanner.accepts(&buried));
        forward(
            &dispatcher,
            &scanner,
            WatchEvent::new(WatchEventKind::Created, &buried),
        )
        .await;
        assert_eq!(rx.try_recv().unwrap().path, buried);

        // A whole tree moved in is walked to the bottom, samples still skipped
        assert_eq!(names(scanner.scan_dir(&dir.path().join("Deep"))), vec!["buried.mkv"]);
        assert_eq!(scanner.scan().len(), 3);
    }

    #[test]
    fn test_depth_limit_applies_to_poll_mode_only() {
        let dir = tree();
        let buried = dir.path().join("Deep/One/Two/buried.mkv");

        let poll = PollScanner::from_config(&config_for(dir.path(), WatchMode::Poll));
        assert!(!poll.accepts(&buried));
        assert!(poll.accepts(&dir.path().join("Release/show.mkv")));

        let flat = PollScanner::from_config(&Config {
            scan_subfolders: false,
            ..config_for(dir.path(), WatchMode::Notify)
        });
        assert!(!flat.accepts(&buried));
        assert!(flat.accepts(&dir.path().join("top.mkv")));
    }

    #[tokio::test]
    async fn test_directory_event_expands_to_files() {
        let dir = tree();
        let scanner = PollScanner::new(dir.path(), 2, true);
        let (dispatcher, rx) = Dispatcher::new(Duration::from_secs(30));

        let moved_in = WatchEvent::new(WatchEventKind::Moved, dir.path().join("Release"));
        forward(&dispatcher, &scanner, moved_in).await;

        let item = rx.try_recv().unwrap();
        assert!(item.path.ends_with("Release/show.mkv"));
        assert!(rx.try_recv().is_err());

        // Modified directories are ignored
        let touched = WatchEvent::new(WatchEventKind::Modified, dir.path().join("Deep"));
        forward(&dispatcher, &scanner, touched).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_loop_submits_each_file_once_per_window() {
        let dir = tree();
        let scanner = PollScanner::new(dir.path(), 2, true);
        let (dispatcher, rx) = Dispatcher::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(poll_loop(
            dispatcher.clone(),
            scanner,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        // Several ticks inside one dedupe window
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut received = Vec::new();
        while let Ok(item) = rx.try_recv() {
            received.push(item.path);
        }
        assert_eq!(names(received), vec!["show.mkv", "top.mkv"]);
    }

    #[tokio::test]
    async fn test_notify_watcher_sees_new_file() {
        let dir = TempDir::new().unwrap();
        let mut watcher = NotifyWatcher::start(dir.path(), true).unwrap();

        let path = dir.path().join("arrival.mkv");
        fs::write(&path, b"data").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = watcher.next().await {
                if event.path.file_name() == path.file_name() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen);
    }
}
