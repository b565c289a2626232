//! Activity and deletion log line formats.
//!
//! Activity lines: `<sequence>\t<unixMillis>\t<kind>\t<noteId-or-*>\t<writerSeq>`
//! Deletion lines: `<sequence>\t<unixMillis>\t<noteId>`
//!
//! Lines are newline-terminated and append-only. Readers tolerate a
//! partially-written trailing line (no terminating newline means stop) and
//! the legacy `|` field separator some older writers produced.

use std::fmt;
use std::str::FromStr;

/// Kind of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// A note received a new CRDT log.
    NoteUpdate,
    /// A note was created (first CRDT log).
    NoteCreated,
    /// A note was permanently deleted (reconciled against the deletion log).
    NoteDeleted,
    /// The folder tree received a new CRDT log.
    FolderUpdate,
}

impl ActivityKind {
    /// The on-disk token for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::NoteUpdate => "note-update",
            ActivityKind::NoteCreated => "note-created",
            ActivityKind::NoteDeleted => "note-deleted",
            ActivityKind::FolderUpdate => "folder-update",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note-update" => Ok(ActivityKind::NoteUpdate),
            "note-created" => Ok(ActivityKind::NoteCreated),
            "note-deleted" => Ok(ActivityKind::NoteDeleted),
            "folder-update" => Ok(ActivityKind::FolderUpdate),
            other => Err(format!("unknown activity kind: {other}")),
        }
    }
}

/// One parsed activity log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Position in the writer's activity log (strictly increasing).
    pub sequence: u64,
    /// Wall-clock time of the write (unix milliseconds).
    pub timestamp_ms: i64,
    /// What happened.
    pub kind: ActivityKind,
    /// The affected note, or None for folder-tree entries (`*` on disk).
    pub note_id: Option<String>,
    /// The CRDT log sequence this entry advertises at its target.
    pub writer_seq: u64,
}

impl ActivityEntry {
    /// Format as one newline-terminated log line.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\n",
            self.sequence,
            self.timestamp_ms,
            self.kind,
            self.note_id.as_deref().unwrap_or("*"),
            self.writer_seq
        )
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Option<Self> {
        let fields = split_fields(line, 5)?;
        Some(Self {
            sequence: fields[0].parse().ok()?,
            timestamp_ms: fields[1].parse().ok()?,
            kind: fields[2].parse().ok()?,
            note_id: match fields[3] {
                "*" => None,
                id => Some(id.to_string()),
            },
            writer_seq: fields[4].parse().ok()?,
        })
    }
}

/// One parsed deletion log line. Deletions are terminal and idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionEntry {
    /// Position in the writer's deletion log (strictly increasing).
    pub sequence: u64,
    /// Wall-clock time of the write (unix milliseconds).
    pub timestamp_ms: i64,
    /// The permanently deleted note.
    pub note_id: String,
}

impl DeletionEntry {
    /// Format as one newline-terminated log line.
    pub fn to_line(&self) -> String {
        format!("{}\t{}\t{}\n", self.sequence, self.timestamp_ms, self.note_id)
    }

    /// Parse one line (without its terminating newline).
    pub fn parse(line: &str) -> Option<Self> {
        let fields = split_fields(line, 3)?;
        Some(Self {
            sequence: fields[0].parse().ok()?,
            timestamp_ms: fields[1].parse().ok()?,
            note_id: fields[2].to_string(),
        })
    }
}

/// Split on `\t`, falling back to the legacy `|` separator. Requires exactly
/// `n` fields.
fn split_fields(line: &str, n: usize) -> Option<Vec<&str>> {
    let tab: Vec<&str> = line.split('\t').collect();
    if tab.len() == n {
        return Some(tab);
    }
    let pipe: Vec<&str> = line.split('|').collect();
    (pipe.len() == n).then_some(pipe)
}

/// Parse a whole log file's content into entries.
///
/// The final segment is only parsed if the content ends with a newline;
/// otherwise it is a partially-written trailing line and parsing stops
/// before it. Malformed complete lines are skipped with a warning (a later
/// entry's sequence still orders correctly).
pub fn parse_log<T>(content: &str, parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    let complete = match content.rfind('\n') {
        Some(pos) => &content[..=pos],
        None => return Vec::new(),
    };
    let mut entries = Vec::new();
    for line in complete.lines() {
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Some(entry) => entries.push(entry),
            None => tracing::warn!("skipping malformed log line: {:?}", line),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_round_trip() {
        let entry = ActivityEntry {
            sequence: 3,
            timestamp_ms: 1700000000000,
            kind: ActivityKind::NoteCreated,
            note_id: Some("00000000-0000-4000-8000-000000000001".to_string()),
            writer_seq: 1,
        };
        let line = entry.to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(ActivityEntry::parse(line.trim_end()), Some(entry));
    }

    #[test]
    fn test_folder_update_uses_star() {
        let entry = ActivityEntry {
            sequence: 9,
            timestamp_ms: 1,
            kind: ActivityKind::FolderUpdate,
            note_id: None,
            writer_seq: 4,
        };
        let line = entry.to_line();
        assert!(line.contains("\t*\t"));
        assert_eq!(ActivityEntry::parse(line.trim_end()).unwrap().note_id, None);
    }

    #[test]
    fn test_legacy_pipe_separator() {
        let entry = ActivityEntry::parse("2|1700000000000|note-update|n-1|5").unwrap();
        assert_eq!(entry.sequence, 2);
        assert_eq!(entry.kind, ActivityKind::NoteUpdate);
        assert_eq!(entry.writer_seq, 5);
    }

    #[test]
    fn test_deletion_round_trip() {
        let entry = DeletionEntry {
            sequence: 1,
            timestamp_ms: 123,
            note_id: "n-1".to_string(),
        };
        assert_eq!(DeletionEntry::parse(entry.to_line().trim_end()), Some(entry));
    }

    #[test]
    fn test_parse_log_stops_at_partial_tail() {
        let content = "1\t10\tnote-created\tn-1\t1\n2\t20\tnote-upd";
        let entries = parse_log(content, ActivityEntry::parse);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
    }

    #[test]
    fn test_parse_log_skips_malformed_middle_line() {
        let content = "1\t10\tnote-created\tn-1\t1\ngarbage\n3\t30\tnote-update\tn-1\t2\n";
        let entries = parse_log(content, ActivityEntry::parse);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 3);
    }

    #[test]
    fn test_parse_log_empty_and_no_newline() {
        assert!(parse_log::<ActivityEntry>("", ActivityEntry::parse).is_empty());
        assert!(parse_log("1\t10\tnote-created\tn\t1", ActivityEntry::parse).is_empty());
    }

    #[test]
    fn test_kind_parse_errors() {
        assert!("note-update".parse::<ActivityKind>().is_ok());
        assert!("nonsense".parse::<ActivityKind>().is_err());
    }
}
