use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for Notefold engine operations
///
/// Many of these are necessary because of the abstracted FileSystem in `fs/`.
#[derive(Debug, Error)]
pub enum NotefoldError {
    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A kind of error representing a failed file read.
    ///
    /// Can occur due to:
    /// - insufficient permissions
    /// - locking/concurrent access
    /// - cloud-sync agents holding the file
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to be read
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },

    /// A kind of error representing a failed file write.
    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to file that failed to be written
        path: PathBuf,
        /// std::io error that caused this error
        source: std::io::Error,
    },

    /// A completed-status snapshot failed to decompress or apply.
    ///
    /// Non-fatal at the store level: the caller may rebuild the document
    /// from its delta logs alone.
    #[error("Corrupt snapshot for '{target}': {message}")]
    CorruptSnapshot {
        /// The store target whose snapshot is corrupt (note id or "folders")
        target: String,
        /// What went wrong while decoding
        message: String,
    },

    /// A CRDT delta log file could not be decoded as a yrs update.
    #[error("Corrupt CRDT log '{path}': {message}")]
    CorruptLog {
        /// Path to the offending log file
        path: PathBuf,
        /// What went wrong while decoding
        message: String,
    },

    /// Registration failed because another storage directory already owns the
    /// same UUID, name, or path. Surfaced verbatim to the operator.
    #[error("Conflicting storage directory: {message} (conflicts with '{existing_name}' at '{existing_path}')")]
    ConflictingSd {
        /// Which constraint was violated
        message: String,
        /// Name of the SD that owns the conflicting value
        existing_name: String,
        /// Path of the SD that owns the conflicting value
        existing_path: PathBuf,
    },

    /// The move state machine rejected a transition. The caller must consult
    /// the journal for the row's actual state.
    #[error("Invalid move state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// State the row is currently in
        from: String,
        /// State the caller attempted to enter
        to: String,
    },

    /// An SD marker refused the load (prod build on a dev SD, or vice versa
    /// without confirmation).
    #[error("Storage directory '{path}' is marked '{marker}' but this is a {build} build")]
    DevProdMismatch {
        /// Path of the refused SD
        path: PathBuf,
        /// Marker found on disk
        marker: String,
        /// Build type of the running process
        build: String,
    },

    /// Retries were exhausted waiting for a note reload to succeed.
    #[error("Timed out after {attempts} attempts: {operation}")]
    Timeout {
        /// Short description of what was being retried
        operation: String,
        /// How many attempts were made
        attempts: u32,
    },

    /// An identifier failed validation (bad UUID, path-traversal guard, or a
    /// writer id containing reserved separator characters).
    #[error("Invalid identifier '{value}': {message}")]
    InvalidId {
        /// The rejected value
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// The same note id was found in two storage directories loaded together.
    #[error("Duplicate note {note_id} in storage directories '{first_sd}' and '{second_sd}'")]
    DuplicateNote {
        /// The colliding note id
        note_id: String,
        /// Name of the first SD holding it
        first_sd: String,
        /// Name of the second SD holding it
        second_sd: String,
    },

    /// A backup could not be restored.
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Error from the logical index database.
    ///
    /// Inherited from `rusqlite::Error`
    #[error("Index database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An error that occured while serializing or deserializing JSON
    /// (profiles, backup metadata).
    ///
    /// Inherited from `serde_json::Error`
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error that occurs when deserializing the config file.
    ///
    /// Inherited from `toml::de::Error`
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config failed to serialize.
    ///
    /// Inherited from `toml::ser::Error`.
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Error indicating a failure to find the user-data directory.
    /// Fatal at startup: the engine cannot run without it.
    #[error("Could not determine user-data directory")]
    NoDataDir,
}

/// Result type alias for Notefold operations
pub type Result<T> = std::result::Result<T, NotefoldError>;

/// A serializable representation of NotefoldError for IPC and shell surfaces
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&NotefoldError> for SerializableError {
    fn from(err: &NotefoldError) -> Self {
        let kind = match err {
            NotefoldError::Io(_) => "Io",
            NotefoldError::FileRead { .. } => "FileRead",
            NotefoldError::FileWrite { .. } => "FileWrite",
            NotefoldError::CorruptSnapshot { .. } => "CorruptSnapshot",
            NotefoldError::CorruptLog { .. } => "CorruptLog",
            NotefoldError::ConflictingSd { .. } => "ConflictingSd",
            NotefoldError::InvalidStateTransition { .. } => "InvalidStateTransition",
            NotefoldError::DevProdMismatch { .. } => "DevProdMismatch",
            NotefoldError::Timeout { .. } => "Timeout",
            NotefoldError::InvalidId { .. } => "InvalidId",
            NotefoldError::DuplicateNote { .. } => "DuplicateNote",
            NotefoldError::RestoreFailed(_) => "RestoreFailed",
            NotefoldError::Database(_) => "Database",
            NotefoldError::Json(_) => "Json",
            NotefoldError::ConfigParse(_) => "ConfigParse",
            NotefoldError::ConfigSerialize(_) => "ConfigSerialize",
            NotefoldError::NoDataDir => "NoDataDir",
        }
        .to_string();

        let path = match err {
            NotefoldError::FileRead { path, .. } => Some(path.clone()),
            NotefoldError::FileWrite { path, .. } => Some(path.clone()),
            NotefoldError::CorruptLog { path, .. } => Some(path.clone()),
            NotefoldError::ConflictingSd { existing_path, .. } => Some(existing_path.clone()),
            NotefoldError::DevProdMismatch { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<NotefoldError> for SerializableError {
    fn from(err: NotefoldError) -> Self {
        SerializableError::from(&err)
    }
}

impl NotefoldError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
