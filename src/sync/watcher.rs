use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Coverage of one `watch_recursive` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchStats {
    pub watched: usize,
    pub unwatched: usize,
}

type SharedWatcher = Arc<Mutex<Option<RecommendedWatcher>>>;
type Pending = Arc<Mutex<HashMap<PathBuf, Instant>>>;

/// Recursive filesystem watcher with per-path debounce.
///
/// The underlying primitive watches single directories, so recursion is
/// manual: `watch_recursive` walks the tree and registers every
/// directory, and directory creations observed later are added to the
/// watch set on the fly. Write/create events land in a pending map; a
/// ticker promotes entries older than the debounce window and hands
/// them to the callback in one batch.
pub struct FsWatcher {
    watcher: SharedWatcher,
    pending: Pending,
    stopped: Arc<AtomicBool>,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FsWatcher {
    pub fn new(
        debounce: Duration,
        on_change: impl Fn(Vec<PathBuf>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<notify::Event>>();

        let inner = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("failed to create filesystem watcher")?;

        let watcher: SharedWatcher = Arc::new(Mutex::new(Some(inner)));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let ticker = {
            let watcher = watcher.clone();
            let pending = pending.clone();
            let stopped = stopped.clone();
            std::thread::Builder::new()
                .name("lantern-watcher".into())
                .spawn(move || {
                    event_loop(debounce, raw_rx, watcher, pending, stopped, on_change);
                })
                .context("failed to spawn watcher thread")?
        };

        Ok(Self {
            watcher,
            pending,
            stopped,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Register every directory under `root` (inclusive). Never fails
    /// fatally; partial coverage is reported through the counts so the
    /// caller can fall back to polling.
    pub fn watch_recursive(&self, root: &Path) -> WatchStats {
        if !root.is_dir() {
            return WatchStats {
                watched: 0,
                unwatched: 1,
            };
        }
        add_watch_tree(&self.watcher, root)
    }

    /// Number of paths currently debouncing. Test and introspection hook.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Idempotent: the first call releases the underlying watcher and
    /// stops the ticker; later calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.watcher.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.ticker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(
    debounce: Duration,
    raw_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    watcher: SharedWatcher,
    pending: Pending,
    stopped: Arc<AtomicBool>,
    on_change: impl Fn(Vec<PathBuf>),
) {
    let tick = debounce.min(Duration::from_millis(100)).max(Duration::from_millis(10));

    loop {
        if stopped.load(Ordering::SeqCst) {
            return;
        }

        match raw_rx.recv_timeout(tick) {
            Ok(Ok(event)) => handle_event(event, &watcher, &pending),
            Ok(Err(e)) => tracing::warn!("watch error: {e}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        // Promote entries that have sat out the debounce window. The
        // snapshot and removal happen under one lock acquisition.
        let ready: Vec<PathBuf> = {
            let Ok(mut guard) = pending.lock() else {
                continue;
            };
            let now = Instant::now();
            let ready: Vec<PathBuf> = guard
                .iter()
                .filter(|(_, &t)| now.duration_since(t) >= debounce)
                .map(|(p, _)| p.clone())
                .collect();
            for path in &ready {
                guard.remove(path);
            }
            ready
        };

        if !ready.is_empty() {
            let mut ready = ready;
            ready.sort();
            on_change(ready);
        }
    }
}

/// Writes and creations feed the pending map; a created directory also
/// joins the watch set. Everything else (chmod, rename, remove) is left
/// to the next full sync.
fn handle_event(event: notify::Event, watcher: &SharedWatcher, pending: &Pending) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
    );
    if !relevant {
        return;
    }

    let is_create = matches!(event.kind, EventKind::Create(_));
    for path in event.paths {
        if is_create && path.is_dir() {
            add_watch_tree(watcher, &path);
            continue;
        }
        if let Ok(mut guard) = pending.lock() {
            guard.insert(path, Instant::now());
        }
    }
}

fn add_watch_tree(watcher: &SharedWatcher, root: &Path) -> WatchStats {
    let mut stats = WatchStats::default();
    let Ok(mut guard) = watcher.lock() else {
        return stats;
    };
    let Some(inner) = guard.as_mut() else {
        return stats;
    };

    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        match inner.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => stats.watched += 1,
            Err(e) => {
                tracing::debug!("could not watch {}: {e}", entry.path().display());
                stats.unwatched += 1;
            }
        }
    }
    stats
}
