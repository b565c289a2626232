//! Stale-sequence tracking.
//!
//! A stale entry records that a peer's activity log advertised a CRDT log
//! file we can't see yet (cloud sync lag or data loss). The set is
//! in-memory per SD; operator skips are persisted through the
//! [`SkipStore`](crate::sync::SkipStore) so they survive restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::profile::ProfilePresence;

/// A recorded gap between what a peer advertised and what has replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleEntry {
    /// Affected note, or None for a folder-tree gap.
    pub note_id: Option<String>,
    /// Writer key of the peer whose log is missing.
    pub source_writer: String,
    /// The CRDT log sequence the activity entry pointed at.
    pub expected_seq: u64,
    /// Highest CRDT log sequence we can actually see for that peer.
    pub highest_seen: u64,
    /// `expected_seq - highest_seen`.
    pub gap: u64,
    /// Unix timestamp of first detection (milliseconds).
    pub detected_at: i64,
    /// Sequence of the activity line that surfaced the gap. Operator skips
    /// are keyed by this, since it's the line the watermark is stuck at.
    pub activity_seq: u64,
}

/// A stale entry joined with the peer's profile presence, for operator
/// display.
#[derive(Debug, Clone, Serialize)]
pub struct StaleDiagnostic {
    /// The underlying stale entry.
    pub entry: StaleEntry,
    /// Profile name of the source writer, when a presence file exists.
    pub profile_name: Option<String>,
    /// Hostname of the source writer, when a presence file exists.
    pub hostname: Option<String>,
}

/// In-memory stale set for one storage directory.
#[derive(Default)]
pub struct StaleTracker {
    entries: Mutex<HashMap<StaleKey, StaleEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StaleKey {
    note_id: Option<String>,
    source_writer: String,
    expected_seq: u64,
}

impl StaleTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a gap. Keeps the original `detected_at` if the same gap is
    /// re-detected on a later sync cycle.
    pub fn record(
        &self,
        note_id: Option<&str>,
        source_writer: &str,
        expected_seq: u64,
        highest_seen: u64,
        activity_seq: u64,
    ) {
        let key = StaleKey {
            note_id: note_id.map(String::from),
            source_writer: source_writer.to_string(),
            expected_seq,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.entry(key).or_insert_with(|| StaleEntry {
            note_id: note_id.map(String::from),
            source_writer: source_writer.to_string(),
            expected_seq,
            highest_seen,
            gap: expected_seq.saturating_sub(highest_seen),
            detected_at: chrono::Utc::now().timestamp_millis(),
            activity_seq,
        });
    }

    /// Drop every entry for a writer whose sequence is now at or below the
    /// consumed point (the missing file arrived, or the line was skipped).
    pub fn resolve_up_to(&self, source_writer: &str, consumed_seq: u64) {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| key.source_writer != source_writer || key.expected_seq > consumed_seq);
    }

    /// Drop every entry for a note (it was deleted).
    pub fn resolve_note(&self, note_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| key.note_id.as_deref() != Some(note_id));
    }

    /// Current entries, ordered by detection time.
    pub fn entries(&self) -> Vec<StaleEntry> {
        let mut out: Vec<StaleEntry> = self.entries.lock().unwrap().values().cloned().collect();
        out.sort_by_key(|e| e.detected_at);
        out
    }

    /// Join entries against profile presence files for operator display.
    pub fn diagnostics(&self, profiles: &[ProfilePresence]) -> Vec<StaleDiagnostic> {
        self.entries()
            .into_iter()
            .map(|entry| {
                let presence = profiles.iter().find(|p| {
                    entry.source_writer == format!("{}_{}", p.profile_id, p.instance_id)
                        || entry.source_writer == p.instance_id
                });
                StaleDiagnostic {
                    profile_name: presence.map(|p| p.profile_name.clone()),
                    hostname: presence.map(|p| p.hostname.clone()),
                    entry,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::WriterId;

    #[test]
    fn test_record_computes_gap() {
        let tracker = StaleTracker::new();
        tracker.record(Some("n-1"), "peer", 5, 2, 11);
        let entries = tracker.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gap, 3);
    }

    #[test]
    fn test_rerecord_keeps_detected_at() {
        let tracker = StaleTracker::new();
        tracker.record(Some("n-1"), "peer", 5, 2, 11);
        let first = tracker.entries()[0].detected_at;
        tracker.record(Some("n-1"), "peer", 5, 4, 11);
        assert_eq!(tracker.entries()[0].detected_at, first);
        // highest_seen keeps the original record too; gap is diagnostic only
        assert_eq!(tracker.entries().len(), 1);
    }

    #[test]
    fn test_resolve_up_to() {
        let tracker = StaleTracker::new();
        tracker.record(Some("n-1"), "peer", 3, 1, 1);
        tracker.record(Some("n-2"), "peer", 5, 1, 2);
        tracker.record(Some("n-3"), "other", 2, 1, 3);

        tracker.resolve_up_to("peer", 3);
        let entries = tracker.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.expected_seq != 3));
    }

    #[test]
    fn test_diagnostics_join_presence() {
        let tracker = StaleTracker::new();
        tracker.record(Some("n-1"), "prof_inst", 2, 1, 1);

        let writer = WriterId::new("prof", "inst").unwrap();
        let presence = ProfilePresence::current(&writer, "Laptop profile", "0.4.0");
        let diags = tracker.diagnostics(&[presence]);
        assert_eq!(diags[0].profile_name.as_deref(), Some("Laptop profile"));
    }
}
