//! On-disk layout of a storage directory.
//!
//! All path construction for an SD goes through [`SdLayout`] so the rest of
//! the engine never concatenates path strings. The layout is:
//!
//! ```text
//! <sd>/
//!   SD_ID                 (one ASCII UUID v4, one line)
//!   SD_VERSION            (integer version tag)
//!   SD_MARKER             ("dev" | "prod")
//!   profiles/<profileId>.json
//!   notes/<noteId>/
//!       snapshot.yjs
//!       logs/<writerId>_<seq>.crdtlog
//!   folders/
//!       snapshot.yjs
//!       logs/<writerId>_<seq>.crdtlog
//!   media/<imageId>.<ext>
//!   activity/<writer>.log
//!   deleted/<writer>.log
//! ```

use std::path::{Path, PathBuf};

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;

/// Name of the snapshot file inside a note or folders directory.
pub const SNAPSHOT_FILE: &str = "snapshot.yjs";

/// Extension of CRDT delta log files.
pub const CRDT_LOG_EXT: &str = "crdtlog";

/// Advisory lock taken while rewriting a snapshot.
pub const COMPACT_LOCK_FILE: &str = ".compact.lock";

/// Path helpers for one storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdLayout {
    root: PathBuf,
}

impl SdLayout {
    /// Wrap an SD root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The SD root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `SD_ID` file.
    pub fn sd_id_file(&self) -> PathBuf {
        self.root.join("SD_ID")
    }

    /// Legacy `.sd-id` file, migrated into `SD_ID` on first contact.
    pub fn legacy_sd_id_file(&self) -> PathBuf {
        self.root.join(".sd-id")
    }

    /// `SD_VERSION` file.
    pub fn sd_version_file(&self) -> PathBuf {
        self.root.join("SD_VERSION")
    }

    /// `SD_MARKER` file.
    pub fn marker_file(&self) -> PathBuf {
        self.root.join("SD_MARKER")
    }

    /// `profiles/` directory.
    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    /// `notes/` directory.
    pub fn notes_dir(&self) -> PathBuf {
        self.root.join("notes")
    }

    /// Directory of one note.
    pub fn note_dir(&self, note_id: &str) -> PathBuf {
        self.notes_dir().join(note_id)
    }

    /// Staging directory used while a note is being moved into this SD.
    pub fn note_staging_dir(&self, note_id: &str) -> PathBuf {
        self.notes_dir().join(format!(".moving-{note_id}"))
    }

    /// Snapshot file of one note.
    pub fn note_snapshot(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join(SNAPSHOT_FILE)
    }

    /// Delta-log directory of one note.
    pub fn note_logs_dir(&self, note_id: &str) -> PathBuf {
        self.note_dir(note_id).join("logs")
    }

    /// `folders/` directory (the single folder-tree target).
    pub fn folders_dir(&self) -> PathBuf {
        self.root.join("folders")
    }

    /// Snapshot file of the folder tree.
    pub fn folders_snapshot(&self) -> PathBuf {
        self.folders_dir().join(SNAPSHOT_FILE)
    }

    /// Delta-log directory of the folder tree.
    pub fn folders_logs_dir(&self) -> PathBuf {
        self.folders_dir().join("logs")
    }

    /// `media/` directory.
    pub fn media_dir(&self) -> PathBuf {
        self.root.join("media")
    }

    /// Path of a media file. Validates the image id as a path-traversal
    /// guard: only 32-hex or UUIDv4 ids are accepted.
    pub fn media_file(&self, image_id: &str, ext: &str) -> Result<PathBuf> {
        if !is_valid_media_id(image_id) {
            return Err(NotefoldError::InvalidId {
                value: image_id.to_string(),
                message: "media ids must be 32-hex or UUIDv4".to_string(),
            });
        }
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NotefoldError::InvalidId {
                value: ext.to_string(),
                message: "media extension must be alphanumeric".to_string(),
            });
        }
        Ok(self.media_dir().join(format!("{image_id}.{ext}")))
    }

    /// `activity/` directory.
    pub fn activity_dir(&self) -> PathBuf {
        self.root.join("activity")
    }

    /// Activity log of one writer.
    pub fn activity_log(&self, writer_key: &str) -> PathBuf {
        self.activity_dir().join(format!("{writer_key}.log"))
    }

    /// `deleted/` directory.
    pub fn deleted_dir(&self) -> PathBuf {
        self.root.join("deleted")
    }

    /// Deletion log of one writer.
    pub fn deletion_log(&self, writer_key: &str) -> PathBuf {
        self.deleted_dir().join(format!("{writer_key}.log"))
    }

    /// Ensure the directory skeleton exists. Idempotent.
    pub fn ensure(&self, fs: &dyn FileSystem) -> Result<()> {
        for dir in [
            self.notes_dir(),
            self.folders_logs_dir(),
            self.activity_dir(),
            self.deleted_dir(),
            self.media_dir(),
            self.profiles_dir(),
        ] {
            fs.create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Media id validation: 32 hex chars or a UUIDv4.
fn is_valid_media_id(id: &str) -> bool {
    if id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    uuid::Uuid::parse_str(id).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn test_layout_paths() {
        let layout = SdLayout::new("/sd");
        assert_eq!(layout.sd_id_file(), PathBuf::from("/sd/SD_ID"));
        assert_eq!(
            layout.note_snapshot("n-1"),
            PathBuf::from("/sd/notes/n-1/snapshot.yjs")
        );
        assert_eq!(
            layout.note_staging_dir("n-1"),
            PathBuf::from("/sd/notes/.moving-n-1")
        );
        assert_eq!(
            layout.activity_log("p_i"),
            PathBuf::from("/sd/activity/p_i.log")
        );
    }

    #[test]
    fn test_ensure_creates_skeleton() {
        let fs = InMemoryFileSystem::new();
        let layout = SdLayout::new("/sd");
        layout.ensure(&fs).unwrap();
        assert!(fs.is_dir(&layout.notes_dir()));
        assert!(fs.is_dir(&layout.folders_logs_dir()));
        assert!(fs.is_dir(&layout.activity_dir()));
        assert!(fs.is_dir(&layout.deleted_dir()));
        assert!(fs.is_dir(&layout.media_dir()));
    }

    #[test]
    fn test_media_id_guard() {
        let layout = SdLayout::new("/sd");
        // 32-hex and UUID forms pass
        assert!(layout
            .media_file("0123456789abcdef0123456789abcdef", "png")
            .is_ok());
        assert!(layout
            .media_file("8c4a9c9e-9a4b-4a6e-8c3d-2f1e0d9c8b7a", "jpg")
            .is_ok());
        // Traversal attempts and junk are rejected
        assert!(layout.media_file("../../etc/passwd", "png").is_err());
        assert!(layout.media_file("short", "png").is_err());
        assert!(layout
            .media_file("0123456789abcdef0123456789abcdef", "p/ng")
            .is_err());
    }
}
