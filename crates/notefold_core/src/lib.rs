#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Backup and restore
pub mod backup;

/// Configuration options
pub mod config;

/// CRDT document wrappers
pub mod crdt;

/// Top-level engine
pub mod engine;

/// Error (common error types)
pub mod error;

/// Domain events
pub mod events;

/// Filesystem and watch capabilities
pub mod fs;

/// Logical index (process-state database)
pub mod index;

/// Cross-SD note move state machine
pub mod moves;

/// Priority-weighted polling group
pub mod polling;

/// Writer identity and profile presence
pub mod profile;

/// Storage-directory tier (layout, markers, per-SD orchestration)
pub mod sd;

/// Append-log store
pub mod store;

/// Activity and deletion logging and sync
pub mod sync;

/// Small shared utilities
pub mod util;

pub use engine::{Engine, EngineOptions};
pub use error::{NotefoldError, Result};
