//! Folder tree CRDT document.
//!
//! One `FolderTreeDoc` per storage directory holds every folder as an entry
//! in a Y.Map keyed by folder id. Entries are JSON-encoded [`FolderEntry`]
//! values, so concurrent edits to different folders merge cleanly and edits
//! to the same folder resolve last-writer-wins at entry granularity.

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use super::types::FolderEntry;
use super::DocError;

/// Name of the Y.Map holding folder entries.
const FOLDERS_MAP_NAME: &str = "folders";

/// A CRDT document for a storage directory's folder tree.
pub struct FolderTreeDoc {
    doc: Doc,
    folders_map: MapRef,
}

impl Default for FolderTreeDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderTreeDoc {
    /// Create a new empty folder tree.
    pub fn new() -> Self {
        let doc = Doc::new();
        let folders_map = doc.get_or_insert_map(FOLDERS_MAP_NAME);
        Self { doc, folders_map }
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

    /// Get a folder entry by id.
    pub fn get_folder(&self, folder_id: &str) -> Option<FolderEntry> {
        let txn = self.doc.transact();
        self.folders_map.get(&txn, folder_id).and_then(|value| {
            let json = value.to_string(&txn);
            serde_json::from_str(&json).ok()
        })
    }

    /// Create or update a folder entry.
    ///
    /// Returns the incremental update bytes, or `None` if encoding produced
    /// nothing (identical re-insert).
    pub fn set_folder(&self, folder_id: &str, entry: &FolderEntry) -> Option<Vec<u8>> {
        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let json = serde_json::to_string(entry).unwrap_or_default();
            self.folders_map.insert(&mut txn, folder_id, json);
        }
        let update = self.encode_update_since(&sv_before);
        (!update.is_empty()).then_some(update)
    }

    /// Soft-delete a folder by id. No-op if the folder is unknown.
    pub fn delete_folder(&self, folder_id: &str) -> Option<Vec<u8>> {
        let mut entry = self.get_folder(folder_id)?;
        if entry.deleted {
            return None;
        }
        entry.mark_deleted();
        self.set_folder(folder_id, &entry)
    }

    /// All folder entries, keyed by id, in stable order.
    pub fn folders(&self) -> BTreeMap<String, FolderEntry> {
        let txn = self.doc.transact();
        self.folders_map
            .iter(&txn)
            .filter_map(|(id, value)| {
                let json = value.to_string(&txn);
                serde_json::from_str(&json)
                    .ok()
                    .map(|entry| (id.to_string(), entry))
            })
            .collect()
    }

    /// Number of live (non-deleted) folders.
    pub fn folder_count(&self) -> usize {
        self.folders().values().filter(|f| !f.deleted).count()
    }
}
