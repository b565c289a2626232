//! Deletion logger: this instance's append-only ledger of permanent note
//! deletions in one storage directory.
//!
//! A separate channel from the activity log so that deletions survive
//! activity-log compaction and can be replayed by instances that were
//! offline for a long time. Same single-writer discipline.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;
use crate::sync::line::{parse_log, DeletionEntry};

/// Single-writer appender for one `deleted/<writer>.log` file.
pub struct DeletionLogger {
    fs: std::sync::Arc<dyn FileSystem>,
    path: PathBuf,
    last_seq: Mutex<Option<u64>>,
}

impl DeletionLogger {
    /// Create a logger for this writer's deletion file in one SD.
    pub fn new(fs: std::sync::Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            last_seq: Mutex::new(None),
        }
    }

    /// The file this logger owns.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Record a permanent deletion. Returns the deletion sequence.
    pub fn record(&self, note_id: &str) -> Result<u64> {
        let mut last = self.last_seq.lock().unwrap();
        let seq = match *last {
            Some(last) => last + 1,
            None => self.recover_last_seq() + 1,
        };
        let entry = DeletionEntry {
            sequence: seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            note_id: note_id.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        self.fs
            .append(&self.path, entry.to_line().as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: self.path.clone(),
                source,
            })?;
        *last = Some(seq);
        Ok(seq)
    }

    fn recover_last_seq(&self) -> u64 {
        let Ok(content) = self.fs.read_to_string(&self.path) else {
            return 0;
        };
        parse_log(&content, DeletionEntry::parse)
            .last()
            .map(|e| e.sequence)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use std::sync::Arc;

    #[test]
    fn test_record_and_recover() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let path = PathBuf::from("/sd/deleted/p_i.log");

        let log = DeletionLogger::new(fs.clone(), path.clone());
        assert_eq!(log.record("n-1").unwrap(), 1);
        assert_eq!(log.record("n-2").unwrap(), 2);

        // Restart continues the sequence.
        let log2 = DeletionLogger::new(fs.clone(), path.clone());
        assert_eq!(log2.record("n-3").unwrap(), 3);

        let content = fs.read_to_string(&path).unwrap();
        let entries = parse_log(&content, DeletionEntry::parse);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].note_id, "n-3");
    }
}
