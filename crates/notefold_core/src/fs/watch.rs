//! Directory watch capability.
//!
//! Filesystem watchers are unreliable on networked filesystems and under
//! cloud-sync agents, so the engine treats them strictly as a fast path: a
//! [`FileWatch`] implementation delivers best-effort [`FileEvent`]s and the
//! polling tier backstops anything it misses.
//!
//! [`NotifyWatcher`] wraps the `notify` crate for native use;
//! [`ManualWatcher`] lets tests inject events deterministically.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A new file appeared.
    Created,
    /// An existing file changed.
    Modified,
    /// A file was removed.
    Removed,
}

/// A normalized filesystem change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Absolute path of the affected file.
    pub path: PathBuf,
    /// What happened.
    pub kind: FileEventKind,
}

/// Keeps a watch alive. Dropping the guard stops event delivery.
pub trait WatchGuard: Send {}

/// Capability for watching a directory for file changes.
///
/// `watch` is non-recursive: the SD manager installs one watch per directory
/// it cares about (`folders/logs/`, `activity/`, `deleted/`, `media/`).
pub trait FileWatch: Send + Sync {
    /// Start watching `dir`, delivering events into `tx` until the returned
    /// guard is dropped.
    fn watch(
        &self,
        dir: &Path,
        tx: mpsc::UnboundedSender<FileEvent>,
    ) -> Result<Box<dyn WatchGuard>>;
}

// ============================================================================
// NotifyWatcher - native implementation
// ============================================================================

/// Native watcher backed by the `notify` crate.
#[derive(Default)]
pub struct NotifyWatcher;

impl NotifyWatcher {
    /// Create a new native watcher factory.
    pub fn new() -> Self {
        Self
    }
}

struct NotifyGuard {
    // Held only for its Drop impl, which stops the OS watcher.
    _watcher: notify::RecommendedWatcher,
}

impl WatchGuard for NotifyGuard {}

/// Collapse notify's platform-specific event kinds into ours. Returns None
/// for events we don't care about (access, metadata-only).
fn map_kind(kind: &notify::EventKind) -> Option<FileEventKind> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Created),
        EventKind::Modify(_) => Some(FileEventKind::Modified),
        EventKind::Remove(_) => Some(FileEventKind::Removed),
        // Renames surface as Modify(Name) on most platforms, already covered.
        _ => None,
    }
}

impl FileWatch for NotifyWatcher {
    fn watch(
        &self,
        dir: &Path,
        tx: mpsc::UnboundedSender<FileEvent>,
    ) -> Result<Box<dyn WatchGuard>> {
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("watcher error: {}", e);
                        return;
                    }
                };
                if let Some(kind) = map_kind(&event.kind) {
                    for path in event.paths {
                        // Receiver gone means the SD was unloaded; stop quietly.
                        let _ = tx.send(FileEvent {
                            path,
                            kind,
                        });
                    }
                }
            },
        )
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::new(ErrorKind::Other, e))?;

        Ok(Box::new(NotifyGuard { _watcher: watcher }))
    }
}

// ============================================================================
// ManualWatcher - test implementation
// ============================================================================

/// Test watcher: events are injected with [`ManualWatcher::emit`] and
/// delivered to whichever watch covers the event's parent directory.
#[derive(Default, Clone)]
pub struct ManualWatcher {
    senders: Arc<Mutex<HashMap<PathBuf, Vec<mpsc::UnboundedSender<FileEvent>>>>>,
}

impl ManualWatcher {
    /// Create a new manual watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to all watches covering the path's parent directory.
    pub fn emit(&self, path: impl Into<PathBuf>, kind: FileEventKind) {
        let path = path.into();
        let Some(parent) = path.parent() else {
            return;
        };
        let senders = self.senders.lock().unwrap();
        if let Some(txs) = senders.get(parent) {
            for tx in txs {
                let _ = tx.send(FileEvent {
                    path: path.clone(),
                    kind,
                });
            }
        }
    }
}

struct ManualGuard;

impl WatchGuard for ManualGuard {}

impl FileWatch for ManualWatcher {
    fn watch(
        &self,
        dir: &Path,
        tx: mpsc::UnboundedSender<FileEvent>,
    ) -> Result<Box<dyn WatchGuard>> {
        self.senders
            .lock()
            .unwrap()
            .entry(dir.to_path_buf())
            .or_default()
            .push(tx);
        Ok(Box::new(ManualGuard))
    }
}
