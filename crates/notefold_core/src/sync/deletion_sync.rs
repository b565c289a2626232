//! Deletion sync: consume peer deletion logs.
//!
//! Deletions are terminal: once processed, the note is removed from the
//! local caches and CRDT store and a permanent-deletion event is emitted.
//! Re-processing is a no-op, a deletion whose target is already gone is a
//! success, and a deletion whose files can't be removed still completes
//! logically (cleanup is retried at next start).

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::profile::WriterId;
use crate::sd::layout::SdLayout;
use crate::sync::line::{parse_log, DeletionEntry};
use crate::sync::metrics::SyncMetrics;
use crate::sync::watermarks::{Channel, WatermarkTable};

/// Capability record for deletion processing.
#[derive(Clone)]
pub struct DeletionCallbacks {
    /// Whether the note has any local presence (index entry, loaded doc, or
    /// files on disk).
    pub note_exists: Arc<dyn Fn(&str) -> bool + Send + Sync>,

    /// Remove the note: drop caches, delete CRDT files, update the index.
    /// Must be idempotent.
    pub remove_note: Arc<dyn Fn(&str) -> Result<()> + Send + Sync>,

    /// Emit the permanent-deletion event. Called once per newly processed
    /// deletion.
    pub on_deleted: Arc<dyn Fn(&str) + Send + Sync>,
}

/// Per-SD consumer of peer deletion logs.
pub struct DeletionSync {
    fs: Arc<dyn FileSystem>,
    layout: SdLayout,
    writer: WriterId,
    watermarks: Arc<WatermarkTable>,
    callbacks: DeletionCallbacks,
    metrics: Arc<dyn SyncMetrics>,
}

impl DeletionSync {
    /// Build a deletion consumer for one SD.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        layout: SdLayout,
        writer: WriterId,
        watermarks: Arc<WatermarkTable>,
        callbacks: DeletionCallbacks,
        metrics: Arc<dyn SyncMetrics>,
    ) -> Self {
        Self {
            fs,
            layout,
            writer,
            watermarks,
            callbacks,
            metrics,
        }
    }

    /// Consume every peer's deletion log past its watermark.
    ///
    /// Returns the notes newly deleted this cycle.
    pub fn sync_from_other_instances(&self) -> Result<BTreeSet<String>> {
        let mut deleted = BTreeSet::new();
        let mut processed = 0usize;

        for (writer_key, path) in self.enumerate_peers() {
            let watermark = self.watermarks.get(Channel::Deletion, &writer_key);
            let content = match self.fs.read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("skipping unreadable deletion log {:?}: {}", path, e);
                    continue;
                }
            };

            let mut entries = parse_log(&content, DeletionEntry::parse);
            entries.retain(|e| e.sequence > watermark);
            entries.sort_by_key(|e| e.sequence);

            for entry in entries {
                if self.process_remote_deletion(&entry.note_id)? {
                    deleted.insert(entry.note_id.clone());
                }
                self.watermarks
                    .advance(Channel::Deletion, &writer_key, entry.sequence);
                processed += 1;
            }
        }

        self.metrics.entries_processed(processed);
        Ok(deleted)
    }

    /// Apply one remote deletion. Returns whether it was newly processed
    /// (false = already gone).
    pub fn process_remote_deletion(&self, note_id: &str) -> Result<bool> {
        if !(self.callbacks.note_exists)(note_id) {
            // Already gone: success.
            return Ok(false);
        }
        if let Err(e) = (self.callbacks.remove_note)(note_id) {
            // The logical deletion still completes; file cleanup is retried
            // at next start.
            tracing::warn!("cleanup for deleted note {} failed: {}", note_id, e);
        }
        (self.callbacks.on_deleted)(note_id);
        Ok(true)
    }

    /// Deletion logs of other writers, as (writer key, path).
    fn enumerate_peers(&self) -> Vec<(String, std::path::PathBuf)> {
        let Ok(paths) = self.fs.list_dir(&self.layout.deleted_dir()) else {
            return Vec::new();
        };
        let mut peers = Vec::new();
        for path in paths {
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".log"))
            else {
                continue;
            };
            if self.writer.matches_key(stem) {
                continue;
            }
            peers.push((stem.to_string(), path));
        }
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::sync::metrics::NoopMetrics;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    struct Harness {
        fs: Arc<InMemoryFileSystem>,
        sync: DeletionSync,
        existing: Arc<Mutex<HashSet<String>>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    fn harness(fail_removal: bool) -> Harness {
        let fs = Arc::new(InMemoryFileSystem::new());
        let existing = Arc::new(Mutex::new(HashSet::new()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let existing_check = existing.clone();
        let existing_remove = existing.clone();
        let events_cb = events.clone();

        let callbacks = DeletionCallbacks {
            note_exists: Arc::new(move |note: &str| {
                existing_check.lock().unwrap().contains(note)
            }),
            remove_note: Arc::new(move |note: &str| {
                if fail_removal {
                    return Err(crate::error::NotefoldError::Io(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "locked",
                    )));
                }
                existing_remove.lock().unwrap().remove(note);
                Ok(())
            }),
            on_deleted: Arc::new(move |note: &str| {
                events_cb.lock().unwrap().push(note.to_string());
            }),
        };

        let sync = DeletionSync::new(
            fs.clone(),
            SdLayout::new("/sd"),
            WriterId::new("me", "local").unwrap(),
            Arc::new(WatermarkTable::new()),
            callbacks,
            Arc::new(NoopMetrics),
        );

        Harness {
            fs,
            sync,
            existing,
            events,
        }
    }

    fn write_peer_log(fs: &InMemoryFileSystem, writer: &str, entries: &[DeletionEntry]) {
        let content: String = entries.iter().map(|e| e.to_line()).collect();
        fs.write(
            Path::new(&format!("/sd/deleted/{writer}.log")),
            content.as_bytes(),
        )
        .unwrap();
    }

    fn entry(seq: u64, note: &str) -> DeletionEntry {
        DeletionEntry {
            sequence: seq,
            timestamp_ms: seq as i64,
            note_id: note.to_string(),
        }
    }

    #[test]
    fn test_deletion_removes_and_emits_once() {
        let h = harness(false);
        h.existing.lock().unwrap().insert("n-1".to_string());
        write_peer_log(&h.fs, "peer_a", &[entry(1, "n-1")]);

        let deleted = h.sync.sync_from_other_instances().unwrap();
        assert!(deleted.contains("n-1"));
        assert!(h.existing.lock().unwrap().is_empty());
        assert_eq!(h.events.lock().unwrap().len(), 1);

        // Re-processing is a no-op.
        let again = h.sync.sync_from_other_instances().unwrap();
        assert!(again.is_empty());
        assert_eq!(h.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deletion_of_unknown_note_is_success() {
        let h = harness(false);
        write_peer_log(&h.fs, "peer_a", &[entry(1, "never-seen")]);

        let deleted = h.sync.sync_from_other_instances().unwrap();
        assert!(deleted.is_empty());
        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(h.sync.watermarks.get(Channel::Deletion, "peer_a"), 1);
    }

    #[test]
    fn test_failed_cleanup_still_completes_logically() {
        let h = harness(true);
        h.existing.lock().unwrap().insert("n-1".to_string());
        write_peer_log(&h.fs, "peer_a", &[entry(1, "n-1")]);

        let deleted = h.sync.sync_from_other_instances().unwrap();
        assert!(deleted.contains("n-1"));
        // The event fires and the watermark advances despite the failure.
        assert_eq!(h.events.lock().unwrap().len(), 1);
        assert_eq!(h.sync.watermarks.get(Channel::Deletion, "peer_a"), 1);
    }

    #[test]
    fn test_own_deletion_log_excluded() {
        let h = harness(false);
        h.existing.lock().unwrap().insert("n-1".to_string());
        write_peer_log(&h.fs, "me_local", &[entry(1, "n-1")]);

        let deleted = h.sync.sync_from_other_instances().unwrap();
        assert!(deleted.is_empty());
        assert!(h.existing.lock().unwrap().contains("n-1"));
    }
}
