//! Core types for the CRDT document wrappers.

use serde::{Deserialize, Serialize};

/// Metadata for a note, as held in the note document's meta map.
///
/// This is the synchronized view; the logical index caches a copy so list
/// surfaces don't need to load the CRDT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteMetadata {
    /// Display title, derived from the first line of the body by the shell
    /// or set explicitly.
    #[serde(default)]
    pub title: String,

    /// Folder the note lives in, or None for the root.
    #[serde(default)]
    pub folder_id: Option<String>,

    /// Unix timestamp of creation (milliseconds)
    #[serde(default)]
    pub created_at: i64,

    /// Unix timestamp of last modification (milliseconds)
    #[serde(default)]
    pub modified_at: i64,
}

impl NoteMetadata {
    /// Create metadata for a newly created note.
    pub fn new(title: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            title: title.into(),
            folder_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Check if two metadata are equal ignoring `modified_at`.
    ///
    /// Used for change detection during sync to avoid false positives when
    /// timestamps differ but content is the same.
    pub fn is_content_equal(&self, other: &Self) -> bool {
        self.title == other.title && self.folder_id == other.folder_id
    }
}

/// One entry in the folder tree document.
///
/// Folders are soft-deleted: the `deleted` flag is a tombstone so concurrent
/// edits from other instances merge cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Display name
    pub name: String,

    /// Parent folder id, or None for a root folder
    #[serde(default)]
    pub parent_id: Option<String>,

    /// Sort rank among siblings
    #[serde(default)]
    pub rank: i64,

    /// Soft deletion tombstone
    #[serde(default)]
    pub deleted: bool,

    /// Unix timestamp of last modification (milliseconds)
    #[serde(default)]
    pub modified_at: i64,
}

impl FolderEntry {
    /// Create a new root-level folder entry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_id: None,
            rank: 0,
            deleted: false,
            modified_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Mark this folder as deleted (soft delete)
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.modified_at = chrono::Utc::now().timestamp_millis();
    }
}
