//! Activity logger: this instance's append-only ledger of note and folder
//! mutations in one storage directory.
//!
//! Exactly one writer per file. Each record is one pre-formatted line
//! appended with a single write call, so peers reading concurrently see
//! whole lines (plus at most one partial tail, which the parser stops at).
//! An optional buffer batches records within a short window for throughput;
//! the buffer MUST be flushed before any persisted acknowledgement.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;
use crate::sync::line::{parse_log, ActivityEntry, ActivityKind};

/// Buffered records are flushed at least this often.
pub const FLUSH_WINDOW: Duration = Duration::from_millis(50);

/// Single-writer appender for one `activity/<writer>.log` file.
pub struct ActivityLogger {
    fs: std::sync::Arc<dyn FileSystem>,
    path: PathBuf,
    state: Mutex<LoggerState>,
}

struct LoggerState {
    /// Last sequence written, or None before the first (lazy) recovery scan.
    last_seq: Option<u64>,
    /// Lines recorded but not yet appended.
    buffer: String,
}

impl ActivityLogger {
    /// Create a logger for this writer's activity file in one SD.
    pub fn new(fs: std::sync::Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            state: Mutex::new(LoggerState {
                last_seq: None,
                buffer: String::new(),
            }),
        }
    }

    /// The file this logger owns.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one record immediately. Returns the activity sequence.
    ///
    /// Any buffered records are flushed first so ordering on disk matches
    /// recording order.
    pub fn record(
        &self,
        kind: ActivityKind,
        note_id: Option<&str>,
        writer_seq: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let entry = self.make_entry(&mut state, kind, note_id, writer_seq);
        let mut out = std::mem::take(&mut state.buffer);
        out.push_str(&entry.to_line());
        self.append(&out)?;
        Ok(entry.sequence)
    }

    /// Buffer one record for a later [`flush`](Self::flush). Returns the
    /// activity sequence it will carry.
    pub fn record_buffered(
        &self,
        kind: ActivityKind,
        note_id: Option<&str>,
        writer_seq: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let entry = self.make_entry(&mut state, kind, note_id, writer_seq);
        state.buffer.push_str(&entry.to_line());
        Ok(entry.sequence)
    }

    /// Append everything buffered. No-op when the buffer is empty.
    pub fn flush(&self) -> Result<()> {
        let out = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.buffer)
        };
        if out.is_empty() {
            return Ok(());
        }
        self.append(&out)
    }

    fn make_entry(
        &self,
        state: &mut LoggerState,
        kind: ActivityKind,
        note_id: Option<&str>,
        writer_seq: u64,
    ) -> ActivityEntry {
        let seq = match state.last_seq {
            Some(last) => last + 1,
            None => self.recover_last_seq() + 1,
        };
        state.last_seq = Some(seq);
        ActivityEntry {
            sequence: seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            note_id: note_id.map(String::from),
            writer_seq,
        }
    }

    /// Last sequence in our own file, recovered on cold start.
    fn recover_last_seq(&self) -> u64 {
        let Ok(content) = self.fs.read_to_string(&self.path) else {
            return 0;
        };
        parse_log(&content, ActivityEntry::parse)
            .last()
            .map(|e| e.sequence)
            .unwrap_or(0)
    }

    fn append(&self, lines: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        self.fs
            .append(&self.path, lines.as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: self.path.clone(),
                source,
            })
    }

    /// Rewrite the file keeping only entries newer than the minimum
    /// sequence every peer has consumed. Atomic replace; buffered records
    /// are flushed first so nothing is lost.
    pub fn compact(&self, min_consumed: u64) -> Result<()> {
        self.flush()?;
        let content = match self.fs.read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(NotefoldError::FileRead {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let kept: String = parse_log(&content, ActivityEntry::parse)
            .into_iter()
            .filter(|e| e.sequence > min_consumed)
            .map(|e| e.to_line())
            .collect();
        self.fs
            .atomic_replace(&self.path, kept.as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: self.path.clone(),
                source,
            })
    }
}
