//! CRDT delta log file naming.
//!
//! Log files are named `<writerKey>_<sequence>.crdtlog`. Writer keys may
//! themselves contain one underscore (`<profileId>_<instanceId>`), so the
//! sequence is split off at the LAST underscore. Sequences are strictly
//! monotonically increasing u64 per (writer, target).

use std::path::{Path, PathBuf};

use crate::fs::FileSystem;
use crate::sd::layout::CRDT_LOG_EXT;

/// A parsed reference to one delta log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRef {
    /// Writer key exactly as it appears in the file name.
    pub writer: String,
    /// Sequence number.
    pub seq: u64,
    /// Full path of the file.
    pub path: PathBuf,
}

/// Format a log file name for a writer key and sequence.
pub fn format_log_name(writer_key: &str, seq: u64) -> String {
    format!("{writer_key}_{seq}.{CRDT_LOG_EXT}")
}

/// Parse a log file name into (writer key, sequence).
///
/// Returns `None` for files that are not delta logs (wrong extension, no
/// separator, non-numeric sequence).
pub fn parse_log_name(name: &str) -> Option<(String, u64)> {
    let stem = name.strip_suffix(&format!(".{CRDT_LOG_EXT}"))?;
    let (writer, seq) = stem.rsplit_once('_')?;
    if writer.is_empty() {
        return None;
    }
    let seq: u64 = seq.parse().ok()?;
    Some((writer.to_string(), seq))
}

/// List all delta logs in a directory, sorted ascending by
/// (writer key, sequence) — the stable application order every reader uses.
///
/// Entries that are not logs are ignored; a failing directory read yields an
/// empty list (the directory may simply not exist yet).
pub fn list_logs(fs: &dyn FileSystem, dir: &Path) -> Vec<LogRef> {
    let Ok(entries) = fs.list_dir(dir) else {
        return Vec::new();
    };
    let mut logs: Vec<LogRef> = entries
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let (writer, seq) = parse_log_name(name)?;
            Some(LogRef { writer, seq, path })
        })
        .collect();
    logs.sort_by(|a, b| a.writer.cmp(&b.writer).then(a.seq.cmp(&b.seq)));
    logs
}

/// Highest sequence present in `dir` for the given writer key, or 0.
pub fn max_seq_for_writer(fs: &dyn FileSystem, dir: &Path, writer_key: &str) -> u64 {
    list_logs(fs, dir)
        .into_iter()
        .filter(|log| log.writer == writer_key)
        .map(|log| log.seq)
        .max()
        .unwrap_or(0)
}
