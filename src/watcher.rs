//! File watcher for the dev loop.
//!
//! Watches the declared watch roots with OS-level notifications and emits
//! debounced `ChangeEvent` batches: a burst of edits within the quiet
//! window coalesces into a single event. Editor temp files and
//! metadata-only changes are ignored so the loop does not restart on noise.
//!
//! notify's callback is synchronous, so events are bridged through a
//! crossbeam channel into a forwarder thread that owns the debouncer and
//! pushes ready batches onto a tokio channel.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{klog_debug, klog_trace, klog_warn, Result};

/// How often the forwarder thread checks the debouncer for readiness.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A debounced batch of filesystem changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The changed paths, deduplicated and sorted.
    pub paths: Vec<PathBuf>,
    /// When the batch was emitted.
    pub at: DateTime<Utc>,
}

/// Pure debouncer: timing and deduplication only, no I/O.
#[derive(Debug)]
pub struct Debouncer {
    changes: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            changes: BTreeSet::new(),
            last_event: None,
            window,
        }
    }

    /// Record a raw notify event, filtering noise.
    pub fn add_event(&mut self, event: &notify::Event) {
        use notify::EventKind;

        match &event.kind {
            EventKind::Create(_) | EventKind::Remove(_) => {}
            EventKind::Modify(modify) => {
                // mtime/atime/chmod noise can trigger endless restart loops
                if matches!(modify, notify::event::ModifyKind::Metadata(_)) {
                    return;
                }
            }
            _ => return,
        }

        for path in &event.paths {
            if is_temp_file(path) {
                continue;
            }
            klog_trace!("watch: {:?} {}", event.kind, path.display());
            self.changes.insert(path.clone());
            self.last_event = Some(Instant::now());
        }
    }

    /// Whether the quiet window has elapsed since the last raw event.
    pub fn is_ready(&self) -> bool {
        match self.last_event {
            Some(last) => last.elapsed() >= self.window,
            None => false,
        }
    }

    /// Take the accumulated batch if the tree has gone quiet.
    pub fn take_if_ready(&mut self) -> Option<Vec<PathBuf>> {
        if !self.is_ready() {
            return None;
        }
        self.last_event = None;
        let changes = std::mem::take(&mut self.changes);
        if changes.is_empty() {
            return None;
        }
        Some(changes.into_iter().collect())
    }

    pub fn pending(&self) -> usize {
        self.changes.len()
    }
}

/// Editor and build droppings that should never trigger a restart.
fn is_temp_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with('~')
        || name.ends_with(".swp")
        || name.ends_with(".swx")
        || name.ends_with(".tmp")
        || name.starts_with(".#")
        || name == "4913" // vim write test file
}

/// Watches a set of roots and emits debounced change events.
///
/// Dropping the watcher stops the stream; creating a new one restarts it.
pub struct FileWatcher {
    // Must stay alive for events to keep flowing.
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl FileWatcher {
    /// Start watching `roots` (recursively) with the given quiet window.
    ///
    /// Roots that do not exist are skipped with a warning rather than
    /// failing the whole loop.
    pub fn spawn(roots: &[PathBuf], window: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = crossbeam_channel::unbounded::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })?;

        let mut unique: BTreeSet<PathBuf> = BTreeSet::new();
        for root in roots {
            unique.insert(root.clone());
        }
        for root in &unique {
            if !root.exists() {
                klog_warn!("watch root does not exist, skipping: {}", root.display());
                continue;
            }
            watcher.watch(root, RecursiveMode::Recursive)?;
            klog_debug!("watching {}", root.display());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Forwarder thread: sync notify events -> debouncer -> tokio channel.
        std::thread::spawn(move || {
            let mut debouncer = Debouncer::new(window);
            loop {
                match raw_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(Ok(event)) => debouncer.add_event(&event),
                    Ok(Err(e)) => klog_warn!("watch error: {}", e),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                if let Some(paths) = debouncer.take_if_ready() {
                    let event = ChangeEvent {
                        paths,
                        at: Utc::now(),
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            events: event_rx,
        })
    }

    /// Receive the next debounced change event.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Take an already-queued event without waiting, if there is one.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}
