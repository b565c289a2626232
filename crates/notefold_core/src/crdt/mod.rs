//! CRDT document wrappers.
//!
//! The engine treats the CRDT library as a capability: apply an update,
//! encode state, read metadata. These wrappers pin that capability to yrs
//! and fix the document shapes (a note's body text + meta map, and the
//! per-SD folder tree map).

mod folder_doc;
mod note_doc;
mod types;

pub use folder_doc::FolderTreeDoc;
pub use note_doc::NoteDoc;
pub use types::{FolderEntry, NoteMetadata};

use thiserror::Error;

/// Errors from decoding or applying a CRDT update.
///
/// The store layer converts these into `CorruptSnapshot`/`CorruptLog` with
/// path context; this type deliberately carries none.
#[derive(Debug, Error)]
pub enum DocError {
    /// The bytes were not a valid encoded update.
    #[error("failed to decode update: {0}")]
    Decode(String),

    /// The update decoded but could not be integrated.
    #[error("failed to apply update: {0}")]
    Apply(String),
}
