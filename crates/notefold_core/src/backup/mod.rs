//! Backup and restore.
//!
//! Two backup shapes share one on-disk format (a directory under the backup
//! root with a `metadata.json`): fast **pre-operation** snapshots taken
//! before destructive actions (affected notes + the logical database), and
//! full **manual** backups of an SD. Restore rebuilds an SD from a backup
//! directory, refusing anything that would collide with what's currently
//! loaded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crdt::FolderTreeDoc;
use crate::error::{NotefoldError, Result};
use crate::fs::{copy_dir_recursive, FileSystem};
use crate::index::LogicalIndex;
use crate::sd::SdLayout;
use crate::store::read_snapshot;

/// Pre-operation backups older than this are garbage collected.
const PRE_OPERATION_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Name suffix given to SDs restored under a fresh identity.
const RESTORED_SUFFIX: &str = " (Restored)";

/// The `metadata.json` stored at the root of every backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// Backup id (directory name under the backup root).
    pub backup_id: String,
    /// UUID of the backed-up SD.
    pub sd_uuid: String,
    /// Name of the backed-up SD at backup time.
    pub sd_name: String,
    /// Unix timestamp of the backup (milliseconds).
    pub timestamp: i64,
    /// How many note directories the backup holds.
    pub note_count: usize,
    /// Live folders in the backed-up folder tree; 0 when the tree wasn't
    /// cheaply loadable.
    pub folder_count: usize,
    /// Total payload size in bytes.
    pub size_bytes: u64,
    /// `"pre-operation"` or `"manual"`.
    #[serde(rename = "type")]
    pub backup_type: String,
    /// Whether the payload is packed into an archive (always false; the
    /// field is kept for format compatibility).
    pub is_packed: bool,
    /// Operator-provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The outcome of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoredSd {
    /// UUID the restored SD ended up with.
    pub sd_uuid: String,
    /// Name it was registered under.
    pub sd_name: String,
    /// Its root path.
    pub path: PathBuf,
}

/// Creates, lists, restores, and garbage-collects backups.
pub struct BackupManager {
    fs: Arc<dyn FileSystem>,
    index: Arc<LogicalIndex>,
    /// Root of the `.backups/` tree in the user-data directory.
    backup_root: PathBuf,
    /// Path of the logical index database, copied into every backup.
    db_path: PathBuf,
}

impl BackupManager {
    /// Create a manager rooted at `backup_root`.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        index: Arc<LogicalIndex>,
        backup_root: PathBuf,
        db_path: PathBuf,
    ) -> Self {
        Self {
            fs,
            index,
            backup_root,
            db_path,
        }
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.backup_root.join(backup_id)
    }

    // ==================== Creation ====================

    /// Fast backup of specific notes before a destructive operation.
    pub fn create_pre_operation(
        &self,
        sd_uuid: &str,
        sd_name: &str,
        sd_root: &Path,
        note_ids: &[String],
        description: &str,
    ) -> Result<BackupMetadata> {
        let backup_id = uuid::Uuid::new_v4().to_string();
        let dest = self.backup_dir(&backup_id);
        let layout = SdLayout::new(sd_root);

        let mut size_bytes = 0u64;
        let mut note_count = 0usize;
        for note_id in note_ids {
            let source = layout.note_dir(note_id);
            if !self.fs.exists(&source) {
                tracing::warn!("pre-operation backup: note {} has no files", note_id);
                continue;
            }
            size_bytes +=
                copy_dir_recursive(self.fs.as_ref(), &source, &dest.join("notes").join(note_id))?;
            note_count += 1;
        }
        size_bytes += self.copy_database(&dest)?;

        let metadata = BackupMetadata {
            backup_id,
            sd_uuid: sd_uuid.to_string(),
            sd_name: sd_name.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            note_count,
            folder_count: 0,
            size_bytes,
            backup_type: "pre-operation".to_string(),
            is_packed: false,
            description: Some(description.to_string()),
        };
        self.write_metadata(&dest, &metadata)?;
        Ok(metadata)
    }

    /// Full backup of an SD: notes, folders, media, activity, SD_VERSION,
    /// plus the logical database.
    pub fn create_manual(
        &self,
        sd_uuid: &str,
        sd_name: &str,
        sd_root: &Path,
        description: Option<&str>,
    ) -> Result<BackupMetadata> {
        let backup_id = uuid::Uuid::new_v4().to_string();
        let dest = self.backup_dir(&backup_id);
        let layout = SdLayout::new(sd_root);

        let mut size_bytes = 0u64;
        for (source, name) in [
            (layout.notes_dir(), "notes"),
            (layout.folders_dir(), "folders"),
            (layout.media_dir(), "media"),
            (layout.activity_dir(), "activity"),
        ] {
            if self.fs.exists(&source) {
                size_bytes += copy_dir_recursive(self.fs.as_ref(), &source, &dest.join(name))?;
            }
        }
        if self.fs.exists(&layout.sd_version_file()) {
            self.fs
                .copy_file(&layout.sd_version_file(), &dest.join("SD_VERSION"))?;
        }
        size_bytes += self.copy_database(&dest)?;

        let metadata = BackupMetadata {
            backup_id,
            sd_uuid: sd_uuid.to_string(),
            sd_name: sd_name.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            note_count: self.count_note_dirs(&dest.join("notes")),
            folder_count: self.count_folders(&dest.join("folders")),
            size_bytes,
            backup_type: "manual".to_string(),
            is_packed: false,
            description: description.map(String::from),
        };
        self.write_metadata(&dest, &metadata)?;
        Ok(metadata)
    }

    fn copy_database(&self, dest: &Path) -> Result<u64> {
        if !self.fs.exists(&self.db_path) {
            return Ok(0);
        }
        let target = dest.join("index.db");
        self.fs.copy_file(&self.db_path, &target)?;
        Ok(self.fs.stat(&target).map(|s| s.len).unwrap_or(0))
    }

    fn write_metadata(&self, dest: &Path, metadata: &BackupMetadata) -> Result<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        let path = dest.join("metadata.json");
        self.fs
            .atomic_replace(&path, json.as_bytes())
            .map_err(|source| NotefoldError::FileWrite { path, source })
    }

    fn count_note_dirs(&self, notes_dir: &Path) -> usize {
        self.fs
            .list_dir(notes_dir)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|p| {
                        self.fs.is_dir(p)
                            && p.file_name()
                                .and_then(|n| n.to_str())
                                .is_some_and(|n| !n.starts_with('.'))
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Live folder count from a backed-up folder tree. Zero when the
    /// snapshot doesn't load cleanly; the count is optional metadata.
    fn count_folders(&self, folders_dir: &Path) -> usize {
        let snapshot_path = folders_dir.join("snapshot.yjs");
        let doc = FolderTreeDoc::new();
        if let Ok(Some(snapshot)) = read_snapshot(self.fs.as_ref(), &snapshot_path)
            && doc.apply_update(&snapshot.state).is_err()
        {
            return 0;
        }
        for log in crate::store::list_logs(self.fs.as_ref(), &folders_dir.join("logs")) {
            if let Ok(bytes) = self.fs.read(&log.path) {
                let _ = doc.apply_update(&bytes);
            }
        }
        doc.folder_count()
    }

    // ==================== Listing & cleanup ====================

    /// Every readable backup under the root, newest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let Ok(entries) = self.fs.list_dir(&self.backup_root) else {
            return Vec::new();
        };
        let mut backups: Vec<BackupMetadata> = entries
            .iter()
            .filter_map(|dir| self.read_metadata(dir).ok())
            .collect();
        backups.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
        backups
    }

    fn read_metadata(&self, backup_dir: &Path) -> Result<BackupMetadata> {
        let path = backup_dir.join("metadata.json");
        if !self.fs.exists(&path) {
            return Err(NotefoldError::RestoreFailed(format!(
                "{backup_dir:?} has no metadata.json"
            )));
        }
        let raw = self
            .fs
            .read_to_string(&path)
            .map_err(|source| NotefoldError::FileRead { path, source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Remove pre-operation backups older than the retention window.
    /// Returns how many were removed.
    pub fn cleanup_old_pre_operation(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - PRE_OPERATION_RETENTION_MS;
        let mut removed = 0;
        for backup in self.list_backups() {
            if backup.backup_type == "pre-operation" && backup.timestamp < cutoff {
                match self.fs.remove_dir_all(&self.backup_dir(&backup.backup_id)) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!("failed to remove old backup {}: {}", backup.backup_id, e)
                    }
                }
            }
        }
        removed
    }

    // ==================== Restore ====================

    /// Restore a backup into `target_dir`.
    ///
    /// Refusal ladder:
    /// 1. no `metadata.json`;
    /// 2. same `sd_uuid` already registered (unless `register_as_new`);
    /// 3. note/folder ids colliding with currently loaded SDs (named);
    /// 4. target directory not empty.
    ///
    /// With `register_as_new` the SD gets a fresh UUID and a
    /// `" (Restored)"` name suffix. The caller brings the SD up afterwards.
    ///
    /// `live_folder_ids` supplies `(folder_id, sd_name)` pairs for every
    /// currently loaded SD.
    pub fn restore(
        &self,
        backup_id: &str,
        target_dir: &Path,
        register_as_new: bool,
        live_folder_ids: &[(String, String)],
    ) -> Result<RestoredSd> {
        let backup_dir = self.backup_dir(backup_id);
        let metadata = self.read_metadata(&backup_dir)?;

        // Duplicate SD identity.
        if !register_as_new
            && let Some(existing) = self.index.get_sd(&metadata.sd_uuid)?
        {
            return Err(NotefoldError::ConflictingSd {
                message: format!(
                    "an SD with UUID {} is already registered; unload it first or restore as new",
                    metadata.sd_uuid
                ),
                existing_name: existing.name,
                existing_path: existing.path,
            });
        }

        // Note/folder collisions against everything currently loaded.
        self.check_collisions(&backup_dir, live_folder_ids)?;

        // Target must exist (or be creatable) and be empty.
        self.fs.create_dir_all(target_dir)?;
        let occupied = self
            .fs
            .list_dir(target_dir)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false);
        if occupied {
            return Err(NotefoldError::RestoreFailed(format!(
                "target directory {target_dir:?} is not empty"
            )));
        }

        // Copy the payload.
        for name in ["notes", "folders", "media", "activity"] {
            let source = backup_dir.join(name);
            if self.fs.exists(&source) {
                copy_dir_recursive(self.fs.as_ref(), &source, &target_dir.join(name))?;
            }
        }
        if self.fs.exists(&backup_dir.join("SD_VERSION")) {
            self.fs
                .copy_file(&backup_dir.join("SD_VERSION"), &target_dir.join("SD_VERSION"))?;
        }

        let (sd_uuid, sd_name) = if register_as_new {
            (
                uuid::Uuid::new_v4().to_string(),
                format!("{}{}", metadata.sd_name, RESTORED_SUFFIX),
            )
        } else {
            (metadata.sd_uuid.clone(), metadata.sd_name.clone())
        };

        let layout = SdLayout::new(target_dir);
        self.fs
            .atomic_replace(&layout.sd_id_file(), format!("{sd_uuid}\n").as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: layout.sd_id_file(),
                source,
            })?;

        // Registration surfaces UNIQUE-name/path conflicts naming the owner.
        let version = crate::sd::read_or_create_version(self.fs.as_ref(), &layout)?;
        self.index
            .register_sd(&sd_uuid, &sd_name, target_dir, version)?;

        Ok(RestoredSd {
            sd_uuid,
            sd_name,
            path: target_dir.to_path_buf(),
        })
    }

    fn check_collisions(
        &self,
        backup_dir: &Path,
        live_folder_ids: &[(String, String)],
    ) -> Result<()> {
        let mut conflicting_sds = BTreeSet::new();

        let notes_dir = backup_dir.join("notes");
        if let Ok(entries) = self.fs.list_dir(&notes_dir) {
            for entry in entries {
                let Some(note_id) = entry.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(existing) = self.index.get_note(note_id)?
                    && !existing.deleted
                    && let Some(sd) = self.index.get_sd(&existing.sd_uuid)?
                {
                    conflicting_sds.insert(sd.name);
                }
            }
        }

        let backup_folder_count = self.count_folders(&backup_dir.join("folders"));
        if backup_folder_count > 0 {
            let doc = FolderTreeDoc::new();
            if let Ok(Some(snapshot)) =
                read_snapshot(self.fs.as_ref(), &backup_dir.join("folders/snapshot.yjs"))
            {
                let _ = doc.apply_update(&snapshot.state);
            }
            for log in crate::store::list_logs(self.fs.as_ref(), &backup_dir.join("folders/logs")) {
                if let Ok(bytes) = self.fs.read(&log.path) {
                    let _ = doc.apply_update(&bytes);
                }
            }
            for folder_id in doc.folders().keys() {
                for (live_id, sd_name) in live_folder_ids {
                    if live_id == folder_id {
                        conflicting_sds.insert(sd_name.clone());
                    }
                }
            }
        }

        if !conflicting_sds.is_empty() {
            let names: Vec<String> = conflicting_sds.into_iter().collect();
            return Err(NotefoldError::RestoreFailed(format!(
                "backup contents collide with loaded storage directories: {}; unload them first",
                names.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::index::NoteRecord;
    use crate::store::{write_snapshot, Snapshot};

    const NOTE: &str = "00000000-0000-4000-8000-000000000001";

    struct Fixture {
        fs: Arc<InMemoryFileSystem>,
        index: Arc<LogicalIndex>,
        manager: BackupManager,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        let index = Arc::new(LogicalIndex::in_memory().unwrap());

        // A small SD with one note and a folder tree.
        fs.write(
            &PathBuf::from(format!("/sd/notes/{NOTE}/snapshot.yjs")),
            b"\x01payload",
        )
        .unwrap();
        fs.write(
            &PathBuf::from(format!("/sd/notes/{NOTE}/logs/w_1.crdtlog")),
            b"log",
        )
        .unwrap();
        let folders = FolderTreeDoc::new();
        folders.set_folder("f-1", &crate::crdt::FolderEntry::new("Inbox"));
        write_snapshot(
            fs.as_ref(),
            &PathBuf::from("/sd/folders/snapshot.yjs"),
            &Snapshot::new(folders.encode_state(), Default::default()),
        )
        .unwrap();
        fs.write(&PathBuf::from("/sd/activity/w.log"), b"1\t1\tnote-created\tn\t1\n")
            .unwrap();
        fs.write(&PathBuf::from("/sd/SD_VERSION"), b"3\n").unwrap();
        fs.write(&PathBuf::from("/data/index.db"), b"sqlite...").unwrap();

        let manager = BackupManager::new(
            fs.clone(),
            index.clone(),
            PathBuf::from("/data/.backups"),
            PathBuf::from("/data/index.db"),
        );
        Fixture { fs, index, manager }
    }

    #[test]
    fn test_pre_operation_backup_copies_notes_and_db() {
        let f = fixture();
        let metadata = f
            .manager
            .create_pre_operation("u1", "Work", Path::new("/sd"), &[NOTE.to_string()], "before delete")
            .unwrap();

        assert_eq!(metadata.backup_type, "pre-operation");
        assert_eq!(metadata.note_count, 1);
        assert!(metadata.size_bytes > 0);

        let dir = PathBuf::from("/data/.backups").join(&metadata.backup_id);
        assert!(f.fs.exists(&dir.join(format!("notes/{NOTE}/snapshot.yjs"))));
        assert!(f.fs.exists(&dir.join("index.db")));
        assert!(f.fs.exists(&dir.join("metadata.json")));
    }

    #[test]
    fn test_manual_backup_counts_folders() {
        let f = fixture();
        let metadata = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), None)
            .unwrap();
        assert_eq!(metadata.backup_type, "manual");
        assert_eq!(metadata.note_count, 1);
        assert_eq!(metadata.folder_count, 1);
        assert!(f.manager.list_backups().iter().any(|b| b.backup_id == metadata.backup_id));
    }

    #[test]
    fn test_restore_refuses_without_metadata() {
        let f = fixture();
        f.fs.create_dir_all(&PathBuf::from("/data/.backups/bogus")).unwrap();
        assert!(matches!(
            f.manager.restore("bogus", Path::new("/restored"), false, &[]),
            Err(NotefoldError::RestoreFailed(_))
        ));
    }

    #[test]
    fn test_restore_refuses_duplicate_uuid_then_succeeds_as_new() {
        let f = fixture();
        let metadata = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), None)
            .unwrap();

        // Same UUID already registered.
        f.index.register_sd("u1", "Work", Path::new("/sd"), 3).unwrap();
        let err = f
            .manager
            .restore(&metadata.backup_id, Path::new("/restored"), false, &[])
            .unwrap_err();
        match err {
            NotefoldError::ConflictingSd { message, existing_name, .. } => {
                assert!(message.contains("u1"));
                assert_eq!(existing_name, "Work");
            }
            other => panic!("unexpected error: {other}"),
        }

        // register_as_new: fresh UUID, suffixed name.
        let restored = f
            .manager
            .restore(&metadata.backup_id, Path::new("/restored"), true, &[])
            .unwrap();
        assert_ne!(restored.sd_uuid, "u1");
        assert_eq!(restored.sd_name, "Work (Restored)");
        assert!(f.fs.exists(&PathBuf::from("/restored/SD_ID")));
        assert!(f
            .fs
            .exists(&PathBuf::from(format!("/restored/notes/{NOTE}/snapshot.yjs"))));
        assert!(f.index.get_sd(&restored.sd_uuid).unwrap().is_some());
    }

    #[test]
    fn test_restore_refuses_note_collision_naming_sd() {
        let f = fixture();
        let metadata = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), None)
            .unwrap();

        // Another loaded SD already owns the same note id.
        f.index.register_sd("u2", "Other", Path::new("/other"), 3).unwrap();
        f.index
            .upsert_note(&NoteRecord {
                note_id: NOTE.to_string(),
                sd_uuid: "u2".to_string(),
                title: "Clash".to_string(),
                folder_id: None,
                created_at: 0,
                modified_at: 0,
                deleted: false,
            })
            .unwrap();

        let err = f
            .manager
            .restore(&metadata.backup_id, Path::new("/restored"), true, &[])
            .unwrap_err();
        match err {
            NotefoldError::RestoreFailed(message) => assert!(message.contains("Other")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_restore_refuses_nonempty_target() {
        let f = fixture();
        let metadata = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), None)
            .unwrap();
        f.fs.write(&PathBuf::from("/restored/junk.txt"), b"x").unwrap();

        assert!(matches!(
            f.manager.restore(&metadata.backup_id, Path::new("/restored"), true, &[]),
            Err(NotefoldError::RestoreFailed(_))
        ));
    }

    #[test]
    fn test_cleanup_removes_only_old_pre_operation() {
        let f = fixture();
        let old = f
            .manager
            .create_pre_operation("u1", "Work", Path::new("/sd"), &[NOTE.to_string()], "old")
            .unwrap();
        let manual = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), None)
            .unwrap();

        // Age the pre-operation backup past retention.
        let dir = PathBuf::from("/data/.backups").join(&old.backup_id);
        let mut aged = old.clone();
        aged.timestamp -= PRE_OPERATION_RETENTION_MS + 1000;
        f.fs.write(
            &dir.join("metadata.json"),
            serde_json::to_string_pretty(&aged).unwrap().as_bytes(),
        )
        .unwrap();

        assert_eq!(f.manager.cleanup_old_pre_operation(), 1);
        let remaining = f.manager.list_backups();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].backup_id, manual.backup_id);
    }

    #[test]
    fn test_metadata_json_uses_camel_case() {
        let f = fixture();
        let metadata = f
            .manager
            .create_manual("u1", "Work", Path::new("/sd"), Some("desc"))
            .unwrap();
        let raw = f
            .fs
            .read_to_string(
                &PathBuf::from("/data/.backups")
                    .join(&metadata.backup_id)
                    .join("metadata.json"),
            )
            .unwrap();
        assert!(raw.contains("\"backupId\""));
        assert!(raw.contains("\"sdUuid\""));
        assert!(raw.contains("\"type\": \"manual\""));
    }
}
