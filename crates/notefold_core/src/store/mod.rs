//! Append-log store.
//!
//! Materializes and persists CRDT documents as `(snapshot, delta logs)`
//! pairs on disk. Each note and each SD's folder tree is a *target*; every
//! writer appends its own strictly-monotonic sequence of delta logs to a
//! target and never touches another writer's files. Compaction folds logs
//! into a fresh snapshot under an advisory lock.

mod log_file;
mod snapshot;

pub use log_file::{format_log_name, list_logs, max_seq_for_writer, parse_log_name, LogRef};
pub use snapshot::{read_snapshot, write_snapshot, Snapshot, SnapshotError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::crdt::{DocError, FolderTreeDoc, NoteDoc};
use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;
use crate::profile::WriterId;
use crate::sd::layout::{SdLayout, COMPACT_LOCK_FILE};

/// A compaction lock older than this is considered a crash leftover and is
/// broken.
const STALE_LOCK_MS: i64 = 10 * 60 * 1000;

/// One store target: a single note's document, or the SD's folder tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTarget {
    /// `notes/<noteId>/`
    Note(String),
    /// `folders/`
    Folders,
}

impl LogTarget {
    fn snapshot_path(&self, layout: &SdLayout) -> PathBuf {
        match self {
            LogTarget::Note(id) => layout.note_snapshot(id),
            LogTarget::Folders => layout.folders_snapshot(),
        }
    }

    fn logs_dir(&self, layout: &SdLayout) -> PathBuf {
        match self {
            LogTarget::Note(id) => layout.note_logs_dir(id),
            LogTarget::Folders => layout.folders_logs_dir(),
        }
    }

    fn lock_dir(&self, layout: &SdLayout) -> PathBuf {
        match self {
            LogTarget::Note(id) => layout.note_dir(id),
            LogTarget::Folders => layout.folders_dir(),
        }
    }

    fn describe(&self) -> String {
        match self {
            LogTarget::Note(id) => format!("notes/{id}"),
            LogTarget::Folders => "folders".to_string(),
        }
    }
}

/// A note materialized from disk.
pub struct LoadedNote {
    /// The CRDT document.
    pub doc: NoteDoc,
    /// Highest log sequence folded in, per writer key (snapshot consumed
    /// vector merged with the logs actually applied).
    pub loaded_sequences: BTreeMap<String, u64>,
    /// True when a complete-status snapshot failed to decode and the
    /// document was rebuilt from logs alone.
    pub recovered_from_logs: bool,
}

/// The folder tree materialized from disk.
pub struct LoadedFolders {
    /// The CRDT document.
    pub doc: FolderTreeDoc,
    /// Highest log sequence folded in, per writer key.
    pub loaded_sequences: BTreeMap<String, u64>,
    /// True when the snapshot was corrupt and the tree was rebuilt from logs.
    pub recovered_from_logs: bool,
}

/// Outcome of a compaction attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Another process holds the compaction lock; nothing was done.
    Skipped,
    /// A new snapshot was written.
    Compacted {
        /// How many superseded delta logs were deleted.
        removed_logs: usize,
    },
}

/// Snapshot + per-writer delta logs for every note and folder tree of the
/// registered storage directories.
///
/// One sequence allocator mutex exists per `(sd, target)`; CRDT apply is
/// single-writer per document (documents are constructed per load and not
/// shared).
pub struct AppendLogStore {
    fs: Arc<dyn FileSystem>,
    writer: WriterId,
    sds: Mutex<HashMap<String, SdLayout>>,
    /// Next-sequence allocators, lazily recovered from a directory scan.
    allocators: Mutex<HashMap<(String, LogTarget), Arc<Mutex<Option<u64>>>>>,
    /// Targets appended to since their last compaction.
    dirty: Mutex<HashSet<(String, LogTarget)>>,
}

impl AppendLogStore {
    /// Create a store for the given writer identity.
    pub fn new(fs: Arc<dyn FileSystem>, writer: WriterId) -> Self {
        Self {
            fs,
            writer,
            sds: Mutex::new(HashMap::new()),
            allocators: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// The writer identity stamping this store's log files.
    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    /// Make the store aware of an SD root. Idempotent.
    pub fn register_sd(&self, sd_id: &str, root: &Path) {
        self.sds
            .lock()
            .unwrap()
            .insert(sd_id.to_string(), SdLayout::new(root));
    }

    /// Forget an SD. Pending allocators and dirty flags are dropped.
    pub fn unregister_sd(&self, sd_id: &str) {
        self.sds.lock().unwrap().remove(sd_id);
        self.allocators
            .lock()
            .unwrap()
            .retain(|(sd, _), _| sd != sd_id);
        self.dirty.lock().unwrap().retain(|(sd, _)| sd != sd_id);
    }

    fn layout(&self, sd_id: &str) -> Result<SdLayout> {
        self.sds
            .lock()
            .unwrap()
            .get(sd_id)
            .cloned()
            .ok_or_else(|| NotefoldError::InvalidId {
                value: sd_id.to_string(),
                message: "storage directory not registered with the store".to_string(),
            })
    }

    // ==================== Loading ====================

    /// Load a note from its snapshot and delta logs.
    pub fn load_note(&self, sd_id: &str, note_id: &str) -> Result<LoadedNote> {
        let layout = self.layout(sd_id)?;
        let target = LogTarget::Note(note_id.to_string());
        let doc = NoteDoc::new();
        let (loaded_sequences, recovered_from_logs) =
            self.load_target(&layout, &target, &|bytes| doc.apply_update(bytes))?;
        Ok(LoadedNote {
            doc,
            loaded_sequences,
            recovered_from_logs,
        })
    }

    /// Load the folder tree from its snapshot and delta logs.
    pub fn load_folders(&self, sd_id: &str) -> Result<LoadedFolders> {
        let layout = self.layout(sd_id)?;
        let doc = FolderTreeDoc::new();
        let (loaded_sequences, recovered_from_logs) =
            self.load_target(&layout, &LogTarget::Folders, &|bytes| {
                doc.apply_update(bytes)
            })?;
        Ok(LoadedFolders {
            doc,
            loaded_sequences,
            recovered_from_logs,
        })
    }

    /// Shared load path: apply snapshot state then every log in ascending
    /// (writer, sequence) order, tracking the highest sequence per writer.
    fn load_target(
        &self,
        layout: &SdLayout,
        target: &LogTarget,
        apply: &dyn Fn(&[u8]) -> std::result::Result<(), DocError>,
    ) -> Result<(BTreeMap<String, u64>, bool)> {
        let snapshot_path = target.snapshot_path(layout);
        let mut loaded_sequences = BTreeMap::new();
        let mut recovered = false;

        match read_snapshot(self.fs.as_ref(), &snapshot_path) {
            Ok(Some(snap)) => {
                if let Err(e) = apply(&snap.state) {
                    tracing::warn!(
                        "corrupt snapshot for {}, rebuilding from logs: {}",
                        target.describe(),
                        e
                    );
                    recovered = true;
                } else {
                    loaded_sequences = snap.consumed;
                }
            }
            Ok(None) => {}
            Err(SnapshotError::Io(source)) => {
                return Err(NotefoldError::FileRead {
                    path: snapshot_path,
                    source,
                });
            }
            Err(SnapshotError::Decode(message)) => {
                tracing::warn!(
                    "corrupt snapshot for {}, rebuilding from logs: {}",
                    target.describe(),
                    message
                );
                recovered = true;
            }
        }

        for log in list_logs(self.fs.as_ref(), &target.logs_dir(layout)) {
            let bytes = match self.fs.read(&log.path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // The file may be mid-replication; the polling tier will
                    // come back for it.
                    tracing::warn!("skipping unreadable log {:?}: {}", log.path, e);
                    continue;
                }
            };
            if let Err(e) = apply(&bytes) {
                tracing::warn!("skipping corrupt log {:?}: {}", log.path, e);
                continue;
            }
            let entry = loaded_sequences.entry(log.writer.clone()).or_insert(0);
            *entry = (*entry).max(log.seq);
        }

        Ok((loaded_sequences, recovered))
    }

    // ==================== Appending ====================

    /// Append a local update to a target, allocating the next sequence for
    /// this writer. The file lands atomically: no partial file exists after
    /// a successful return.
    pub fn append_local_update(
        &self,
        sd_id: &str,
        target: &LogTarget,
        update: &[u8],
    ) -> Result<u64> {
        let layout = self.layout(sd_id)?;
        let allocator = self.allocator(sd_id, target);
        let mut next = allocator.lock().unwrap();

        let seq = match *next {
            Some(last) => last + 1,
            None => self.recover_seq(&layout, target)? + 1,
        };

        let logs_dir = target.logs_dir(&layout);
        self.fs.create_dir_all(&logs_dir)?;
        let path = logs_dir.join(format_log_name(&self.writer.key(), seq));
        self.fs
            .atomic_replace(&path, update)
            .map_err(|source| NotefoldError::FileWrite {
                path: path.clone(),
                source,
            })?;

        *next = Some(seq);
        self.dirty
            .lock()
            .unwrap()
            .insert((sd_id.to_string(), target.clone()));
        Ok(seq)
    }

    fn allocator(&self, sd_id: &str, target: &LogTarget) -> Arc<Mutex<Option<u64>>> {
        self.allocators
            .lock()
            .unwrap()
            .entry((sd_id.to_string(), target.clone()))
            .or_default()
            .clone()
    }

    /// Recover the highest sequence this writer has ever used at a target.
    ///
    /// The directory scan alone is not enough: compaction may have deleted
    /// our older logs, so the snapshot's consumed vector is consulted too.
    fn recover_seq(&self, layout: &SdLayout, target: &LogTarget) -> Result<u64> {
        let from_dir =
            max_seq_for_writer(self.fs.as_ref(), &target.logs_dir(layout), &self.writer.key());
        let from_snapshot = match read_snapshot(self.fs.as_ref(), &target.snapshot_path(layout)) {
            Ok(Some(snap)) => snap.consumed.get(&self.writer.key()).copied().unwrap_or(0),
            _ => 0,
        };
        Ok(from_dir.max(from_snapshot))
    }

    // ==================== Queries ====================

    /// O(1) path predicate: does a specific writer's log exist at a target?
    pub fn check_log_exists(
        &self,
        sd_id: &str,
        target: &LogTarget,
        writer_key: &str,
        seq: u64,
    ) -> bool {
        let Ok(layout) = self.layout(sd_id) else {
            return false;
        };
        let path = target.logs_dir(&layout).join(format_log_name(writer_key, seq));
        self.fs.exists(&path)
    }

    /// Like [`check_log_exists`], but also true when the target's snapshot
    /// has already consumed the sequence. A compaction legitimately deletes
    /// logs that peers' activity entries still reference; a consumed
    /// sequence is not a gap.
    pub fn check_log_covered(
        &self,
        sd_id: &str,
        target: &LogTarget,
        writer_key: &str,
        seq: u64,
    ) -> bool {
        if self.check_log_exists(sd_id, target, writer_key, seq) {
            return true;
        }
        let Ok(layout) = self.layout(sd_id) else {
            return false;
        };
        match read_snapshot(self.fs.as_ref(), &target.snapshot_path(&layout)) {
            Ok(Some(snapshot)) => {
                snapshot.consumed.get(writer_key).copied().unwrap_or(0) >= seq
            }
            _ => false,
        }
    }

    /// Does a note have any on-disk presence in this SD?
    pub fn note_exists(&self, sd_id: &str, note_id: &str) -> bool {
        let Ok(layout) = self.layout(sd_id) else {
            return false;
        };
        self.fs.exists(&layout.note_dir(note_id))
    }

    /// Note ids present under `notes/`, skipping move-staging directories.
    pub fn list_note_ids(&self, sd_id: &str) -> Vec<String> {
        let Ok(layout) = self.layout(sd_id) else {
            return Vec::new();
        };
        let Ok(entries) = self.fs.list_dir(&layout.notes_dir()) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter(|p| self.fs.is_dir(p))
            .filter_map(|p| p.file_name()?.to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect()
    }

    /// Remove every file of a note. Used by deletion sync and move cleanup.
    pub fn delete_note_files(&self, sd_id: &str, note_id: &str) -> Result<()> {
        let layout = self.layout(sd_id)?;
        let dir = layout.note_dir(note_id);
        if self.fs.exists(&dir) {
            self.fs.remove_dir_all(&dir)?;
        }
        self.allocators
            .lock()
            .unwrap()
            .remove(&(sd_id.to_string(), LogTarget::Note(note_id.to_string())));
        self.dirty
            .lock()
            .unwrap()
            .remove(&(sd_id.to_string(), LogTarget::Note(note_id.to_string())));
        Ok(())
    }

    // ==================== Compaction ====================

    /// Compact a target: reload it, write a fresh snapshot, delete the logs
    /// the snapshot supersedes. Skips when another process holds the
    /// advisory lock.
    pub fn compact(&self, sd_id: &str, target: &LogTarget) -> Result<CompactOutcome> {
        let layout = self.layout(sd_id)?;
        let lock_path = target.lock_dir(&layout).join(COMPACT_LOCK_FILE);

        if !self.try_lock(&lock_path)? {
            tracing::debug!("compaction lock held for {}, skipping", target.describe());
            return Ok(CompactOutcome::Skipped);
        }

        let result = self.compact_locked(sd_id, &layout, target);
        if let Err(e) = self.fs.remove_file(&lock_path) {
            tracing::warn!("failed to release compaction lock {:?}: {}", lock_path, e);
        }
        result
    }

    fn compact_locked(
        &self,
        sd_id: &str,
        layout: &SdLayout,
        target: &LogTarget,
    ) -> Result<CompactOutcome> {
        // Re-load so the snapshot captures everything currently on disk.
        let (state, consumed) = match target {
            LogTarget::Note(note_id) => {
                let loaded = self.load_note(sd_id, note_id)?;
                (loaded.doc.encode_state(), loaded.loaded_sequences)
            }
            LogTarget::Folders => {
                let loaded = self.load_folders(sd_id)?;
                (loaded.doc.encode_state(), loaded.loaded_sequences)
            }
        };

        let snapshot_path = target.snapshot_path(layout);
        write_snapshot(
            self.fs.as_ref(),
            &snapshot_path,
            &Snapshot::new(state, consumed.clone()),
        )
        .map_err(|source| NotefoldError::FileWrite {
            path: snapshot_path,
            source,
        })?;

        // Delete logs folded into the snapshot. Anything newer than the
        // consumed vector (a concurrent append) survives.
        let mut removed = 0;
        for log in list_logs(self.fs.as_ref(), &target.logs_dir(layout)) {
            let consumed_seq = consumed.get(&log.writer).copied().unwrap_or(0);
            if log.seq <= consumed_seq {
                match self.fs.remove_file(&log.path) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("failed to delete log {:?}: {}", log.path, e),
                }
            }
        }

        self.dirty
            .lock()
            .unwrap()
            .remove(&(sd_id.to_string(), target.clone()));
        Ok(CompactOutcome::Compacted {
            removed_logs: removed,
        })
    }

    /// Take the advisory compaction lock. Breaks locks older than
    /// [`STALE_LOCK_MS`] (crash leftovers).
    fn try_lock(&self, lock_path: &Path) -> Result<bool> {
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        match self.fs.create_new(lock_path, stamp.as_bytes()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = self
                    .fs
                    .stat(lock_path)
                    .map(|s| chrono::Utc::now().timestamp_millis() - s.modified_ms)
                    .unwrap_or(0);
                if age > STALE_LOCK_MS {
                    tracing::warn!("breaking stale compaction lock {:?}", lock_path);
                    let _ = self.fs.remove_file(lock_path);
                    return Ok(self.fs.create_new(lock_path, stamp.as_bytes()).is_ok());
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Force compaction for every target appended to since its last
    /// compaction. Used at shutdown.
    pub fn flush_snapshots(&self, mut progress: Option<&mut dyn FnMut(usize, usize)>) -> Result<()> {
        let dirty: Vec<(String, LogTarget)> = self.dirty.lock().unwrap().iter().cloned().collect();
        let total = dirty.len();
        for (i, (sd_id, target)) in dirty.into_iter().enumerate() {
            if let Err(e) = self.compact(&sd_id, &target) {
                tracing::warn!("flush compaction failed for {}: {}", target.describe(), e);
            }
            if let Some(cb) = progress.as_mut() {
                cb(i + 1, total);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    fn store() -> AppendLogStore {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let store = AppendLogStore::new(fs, WriterId::new("prof", "inst").unwrap());
        store.register_sd("sd-1", Path::new("/sd"));
        store
    }

    fn note_target() -> LogTarget {
        LogTarget::Note("11111111-0000-4000-8000-000000000001".to_string())
    }

    #[test]
    fn test_append_allocates_monotonic_sequences() {
        let store = store();
        let doc = NoteDoc::new();
        let u1 = doc.set_body("a").unwrap();
        let u2 = doc.set_body("ab").unwrap();

        assert_eq!(
            store.append_local_update("sd-1", &note_target(), &u1).unwrap(),
            1
        );
        assert_eq!(
            store.append_local_update("sd-1", &note_target(), &u2).unwrap(),
            2
        );
        assert!(store.check_log_exists("sd-1", &note_target(), "prof_inst", 1));
        assert!(store.check_log_exists("sd-1", &note_target(), "prof_inst", 2));
        assert!(!store.check_log_exists("sd-1", &note_target(), "prof_inst", 3));
    }

    #[test]
    fn test_load_replays_logs_in_order() {
        let store = store();
        let target = note_target();
        let LogTarget::Note(note_id) = &target else {
            unreachable!()
        };

        let doc = NoteDoc::new();
        for body in ["one", "one two", "one two three"] {
            let update = doc.set_body(body).unwrap();
            store.append_local_update("sd-1", &target, &update).unwrap();
        }

        let loaded = store.load_note("sd-1", note_id).unwrap();
        assert_eq!(loaded.doc.get_body(), "one two three");
        assert_eq!(loaded.loaded_sequences.get("prof_inst"), Some(&3));
        assert!(!loaded.recovered_from_logs);
    }

    #[test]
    fn test_compact_then_load_is_equivalent() {
        let store = store();
        let target = note_target();
        let LogTarget::Note(note_id) = &target else {
            unreachable!()
        };

        let doc = NoteDoc::new();
        let u1 = doc.set_body("hello").unwrap();
        let u2 = doc.set_title("T").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();
        store.append_local_update("sd-1", &target, &u2).unwrap();

        let outcome = store.compact("sd-1", &target).unwrap();
        assert_eq!(outcome, CompactOutcome::Compacted { removed_logs: 2 });

        let loaded = store.load_note("sd-1", note_id).unwrap();
        assert_eq!(loaded.doc.get_body(), "hello");
        assert_eq!(loaded.doc.get_metadata().title, "T");
        // The consumed vector survives the compaction.
        assert_eq!(loaded.loaded_sequences.get("prof_inst"), Some(&2));
    }

    #[test]
    fn test_sequences_survive_compaction() {
        // After compaction deletes our logs, new appends must continue the
        // sequence, not restart at 1.
        let store = store();
        let target = note_target();

        let doc = NoteDoc::new();
        let u1 = doc.set_body("x").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();
        store.compact("sd-1", &target).unwrap();

        // Fresh store simulates a restart (allocator recovered from disk).
        let fs = store.fs.clone();
        let store2 = AppendLogStore::new(fs, WriterId::new("prof", "inst").unwrap());
        store2.register_sd("sd-1", Path::new("/sd"));
        let u2 = doc.set_body("xy").unwrap();
        assert_eq!(
            store2.append_local_update("sd-1", &target, &u2).unwrap(),
            2
        );
    }

    #[test]
    fn test_corrupt_snapshot_rebuilds_from_logs() {
        let store = store();
        let target = note_target();
        let LogTarget::Note(note_id) = &target else {
            unreachable!()
        };

        let doc = NoteDoc::new();
        let u1 = doc.set_body("survives").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();

        // Write garbage with a complete status byte where the snapshot goes.
        let layout = store.layout("sd-1").unwrap();
        store
            .fs
            .write(&layout.note_snapshot(note_id), &[0x01, 0xde, 0xad])
            .unwrap();

        let loaded = store.load_note("sd-1", note_id).unwrap();
        assert!(loaded.recovered_from_logs);
        assert_eq!(loaded.doc.get_body(), "survives");
    }

    #[test]
    fn test_compacted_sequence_counts_as_covered() {
        let store = store();
        let target = note_target();
        let doc = NoteDoc::new();
        let u1 = doc.set_body("x").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();
        store.compact("sd-1", &target).unwrap();

        // The file is gone, but the snapshot consumed it.
        assert!(!store.check_log_exists("sd-1", &target, "prof_inst", 1));
        assert!(store.check_log_covered("sd-1", &target, "prof_inst", 1));
        assert!(!store.check_log_covered("sd-1", &target, "prof_inst", 2));
    }

    #[test]
    fn test_compact_skips_when_lock_held() {
        let store = store();
        let target = note_target();

        let doc = NoteDoc::new();
        let u1 = doc.set_body("x").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();

        let layout = store.layout("sd-1").unwrap();
        let lock = target.lock_dir(&layout).join(COMPACT_LOCK_FILE);
        store
            .fs
            .create_new(&lock, chrono::Utc::now().timestamp_millis().to_string().as_bytes())
            .unwrap();

        assert_eq!(store.compact("sd-1", &target).unwrap(), CompactOutcome::Skipped);
    }

    #[test]
    fn test_flush_snapshots_compacts_dirty_targets() {
        let store = store();
        let target = note_target();
        let doc = NoteDoc::new();
        let u1 = doc.set_body("flush me").unwrap();
        store.append_local_update("sd-1", &target, &u1).unwrap();

        let mut seen = Vec::new();
        let mut cb = |done: usize, total: usize| seen.push((done, total));
        store.flush_snapshots(Some(&mut cb)).unwrap();
        assert_eq!(seen, vec![(1, 1)]);
        assert!(store.dirty.lock().unwrap().is_empty());
    }

    #[test]
    fn test_folders_target_round_trip() {
        let store = store();
        let folders = FolderTreeDoc::new();
        let update = folders
            .set_folder("f-1", &crate::crdt::FolderEntry::new("Inbox"))
            .unwrap();
        store
            .append_local_update("sd-1", &LogTarget::Folders, &update)
            .unwrap();

        let loaded = store.load_folders("sd-1").unwrap();
        assert_eq!(loaded.doc.folder_count(), 1);
    }

    #[test]
    fn test_list_note_ids_skips_staging() {
        let store = store();
        let target = note_target();
        let doc = NoteDoc::new();
        let u = doc.set_body("x").unwrap();
        store.append_local_update("sd-1", &target, &u).unwrap();

        // A move staging dir must not appear as a note.
        store
            .fs
            .write(Path::new("/sd/notes/.moving-abc/logs/w_1.crdtlog"), b"x")
            .unwrap();

        let ids = store.list_note_ids("sd-1");
        assert_eq!(ids, vec!["11111111-0000-4000-8000-000000000001".to_string()]);
    }

    #[test]
    fn test_delete_note_files() {
        let store = store();
        let target = note_target();
        let LogTarget::Note(note_id) = &target else {
            unreachable!()
        };
        let doc = NoteDoc::new();
        let u = doc.set_body("x").unwrap();
        store.append_local_update("sd-1", &target, &u).unwrap();

        store.delete_note_files("sd-1", note_id).unwrap();
        assert!(!store.note_exists("sd-1", note_id));
        // Idempotent
        store.delete_note_files("sd-1", note_id).unwrap();
    }
}
