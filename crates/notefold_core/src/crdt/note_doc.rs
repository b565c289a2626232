//! Per-note CRDT document.
//!
//! This module provides `NoteDoc`, a Y.Doc wrapping one note: a Y.Text for
//! the body content and a Y.Map for metadata (title, folder, timestamps).
//! The append-log store materializes a `NoteDoc` from a snapshot plus delta
//! logs; local mutators hand back the incremental update bytes for the store
//! to append.

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Map, MapRef, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use super::types::NoteMetadata;
use super::DocError;

/// Name of the Y.Text holding the note body content.
const BODY_TEXT_NAME: &str = "body";

/// Name of the Y.Map holding note metadata.
const META_MAP_NAME: &str = "meta";

/// A CRDT document for a single note.
///
/// # Example
///
/// ```ignore
/// use notefold_core::crdt::NoteDoc;
///
/// let doc = NoteDoc::new();
/// let update = doc.set_body("hello").unwrap();
/// assert!(update.is_some()); // bytes to append to the note's delta log
/// assert_eq!(doc.get_body(), "hello");
/// ```
pub struct NoteDoc {
    doc: Doc,
    body_text: TextRef,
    meta_map: MapRef,
}

impl Default for NoteDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteDoc {
    /// Create a new empty note document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let body_text = doc.get_or_insert_text(BODY_TEXT_NAME);
        let meta_map = doc.get_or_insert_map(META_MAP_NAME);
        Self {
            doc,
            body_text,
            meta_map,
        }
    }

    /// Apply an encoded update (snapshot payload or one delta log).
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// The current state vector, for incremental encoding.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    /// Encode everything the given state vector is missing.
    pub fn encode_update_since(&self, sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(sv)
    }

    /// Whether this document carries any content at all.
    ///
    /// An empty document after a load means the on-disk files were
    /// incomplete (cloud sync mid-flight); the reload path treats that as a
    /// retryable error.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.body_text.get_string(&txn).is_empty() && self.meta_map.len(&txn) == 0
    }

    // ==================== Body Content Operations ====================

    /// Get the full body content as a string.
    pub fn get_body(&self) -> String {
        let txn = self.doc.transact();
        self.body_text.get_string(&txn)
    }

    /// Set the body content, using minimal diff operations.
    ///
    /// Instead of delete-all + insert-all (which breaks CRDT merging), this
    /// calculates the minimal diff between current and new content, applying
    /// only the necessary insert/delete operations so operation IDs are
    /// preserved where content hasn't changed.
    ///
    /// Returns the incremental update bytes, or `None` if nothing changed.
    pub fn set_body(&self, content: &str) -> Option<Vec<u8>> {
        let (current, sv_before) = {
            let txn = self.doc.transact();
            (self.body_text.get_string(&txn), txn.state_vector())
        };

        if current == content {
            return None;
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // Common suffix, not overlapping the prefix
        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_start = common_prefix;
        let delete_end = current_chars.len() - common_suffix;
        let insert_start = common_prefix;
        let insert_end = new_chars.len() - common_suffix;

        {
            let mut txn = self.doc.transact_mut();
            if delete_end > delete_start {
                let delete_len = (delete_end - delete_start) as u32;
                self.body_text
                    .remove_range(&mut txn, delete_start as u32, delete_len);
            }
            if insert_end > insert_start {
                let insert_text: String = new_chars[insert_start..insert_end].iter().collect();
                self.body_text
                    .insert(&mut txn, delete_start as u32, &insert_text);
            }
        }

        let update = self.encode_update_since(&sv_before);
        (!update.is_empty()).then_some(update)
    }

    // ==================== Metadata Operations ====================

    /// Read the metadata map into a [`NoteMetadata`] view.
    pub fn get_metadata(&self) -> NoteMetadata {
        let txn = self.doc.transact();
        let get_str = |key: &str| -> Option<String> {
            self.meta_map.get(&txn, key).map(|v| v.to_string(&txn))
        };
        let get_i64 = |key: &str| -> i64 {
            self.meta_map
                .get(&txn, key)
                .map(|v| v.to_string(&txn))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };
        NoteMetadata {
            title: get_str("title").unwrap_or_default(),
            folder_id: get_str("folder_id").filter(|s| !s.is_empty()),
            created_at: get_i64("created_at"),
            modified_at: get_i64("modified_at"),
        }
    }

    /// Write the full metadata view into the meta map.
    ///
    /// Returns the incremental update bytes, or `None` if nothing changed.
    pub fn set_metadata(&self, meta: &NoteMetadata) -> Option<Vec<u8>> {
        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            self.meta_map.insert(&mut txn, "title", meta.title.clone());
            self.meta_map.insert(
                &mut txn,
                "folder_id",
                meta.folder_id.clone().unwrap_or_default(),
            );
            self.meta_map
                .insert(&mut txn, "created_at", meta.created_at.to_string());
            self.meta_map
                .insert(&mut txn, "modified_at", meta.modified_at.to_string());
        }
        let update = self.encode_update_since(&sv_before);
        (!update.is_empty()).then_some(update)
    }

    /// Set just the title, stamping `modified_at`.
    pub fn set_title(&self, title: &str) -> Option<Vec<u8>> {
        let mut meta = self.get_metadata();
        if meta.title == title {
            return None;
        }
        meta.title = title.to_string();
        meta.modified_at = chrono::Utc::now().timestamp_millis();
        self.set_metadata(&meta)
    }

    /// Set just the folder, stamping `modified_at`.
    pub fn set_folder(&self, folder_id: Option<&str>) -> Option<Vec<u8>> {
        let mut meta = self.get_metadata();
        if meta.folder_id.as_deref() == folder_id {
            return None;
        }
        meta.folder_id = folder_id.map(String::from);
        meta.modified_at = chrono::Utc::now().timestamp_millis();
        self.set_metadata(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_doc_is_empty() {
        let doc = NoteDoc::new();
        assert!(doc.is_empty());
        assert_eq!(doc.get_body(), "");
    }

    #[test]
    fn test_set_body_returns_update() {
        let doc = NoteDoc::new();
        let update = doc.set_body("hello world");
        assert!(update.is_some());
        assert_eq!(doc.get_body(), "hello world");

        // No-op set returns None
        assert!(doc.set_body("hello world").is_none());
    }

    #[test]
    fn test_updates_replay_into_fresh_doc() {
        let doc = NoteDoc::new();
        let u1 = doc.set_body("hello").unwrap();
        let u2 = doc.set_body("hello world").unwrap();
        let u3 = doc.set_title("Greeting").unwrap();

        let replica = NoteDoc::new();
        replica.apply_update(&u1).unwrap();
        replica.apply_update(&u2).unwrap();
        replica.apply_update(&u3).unwrap();

        assert_eq!(replica.get_body(), "hello world");
        assert_eq!(replica.get_metadata().title, "Greeting");
    }

    #[test]
    fn test_apply_same_update_twice_is_idempotent() {
        let doc = NoteDoc::new();
        let update = doc.set_body("once").unwrap();

        let replica = NoteDoc::new();
        replica.apply_update(&update).unwrap();
        replica.apply_update(&update).unwrap();
        assert_eq!(replica.get_body(), "once");
    }

    #[test]
    fn test_minimal_diff_preserves_concurrent_edits() {
        // Two replicas diverge; both edits should survive the merge because
        // set_body only touches the changed range.
        let a = NoteDoc::new();
        let seed = a.set_body("shared middle text").unwrap();

        let b = NoteDoc::new();
        b.apply_update(&seed).unwrap();

        let ua = a.set_body("PREFIX shared middle text").unwrap();
        let ub = b.set_body("shared middle text SUFFIX").unwrap();

        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        assert_eq!(a.get_body(), b.get_body());
        assert!(a.get_body().contains("PREFIX"));
        assert!(a.get_body().contains("SUFFIX"));
    }

    #[test]
    fn test_encode_state_round_trip() {
        let doc = NoteDoc::new();
        doc.set_body("state");
        doc.set_title("T");

        let state = doc.encode_state();
        let replica = NoteDoc::new();
        replica.apply_update(&state).unwrap();
        assert_eq!(replica.get_body(), "state");
        assert_eq!(replica.get_metadata().title, "T");
    }

    #[test]
    fn test_garbage_update_is_decode_error() {
        let doc = NoteDoc::new();
        assert!(matches!(
            doc.apply_update(b"definitely not an update"),
            Err(DocError::Decode(_))
        ));
    }

    #[test]
    fn test_set_folder() {
        let doc = NoteDoc::new();
        doc.set_metadata(&NoteMetadata::new("n"));
        assert!(doc.set_folder(Some("f-1")).is_some());
        assert_eq!(doc.get_metadata().folder_id.as_deref(), Some("f-1"));
        assert!(doc.set_folder(Some("f-1")).is_none());
        assert!(doc.set_folder(None).is_some());
        assert_eq!(doc.get_metadata().folder_id, None);
    }
}
