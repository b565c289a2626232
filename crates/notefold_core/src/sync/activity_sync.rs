//! Activity sync: consume peer activity logs and turn them into reload
//! decisions.
//!
//! One `ActivitySync` per storage directory. Each cycle enumerates the other
//! writers' activity logs, reads everything past the per-peer watermark, and
//! dispatches by entry kind. Watermarks only advance over contiguous
//! successfully-processed prefixes; a missing CRDT log halts that peer and
//! records a stale entry so the polling tier retries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::profile::WriterId;
use crate::sd::layout::SdLayout;
use crate::sync::line::{parse_log, ActivityEntry, ActivityKind};
use crate::sync::metrics::SyncMetrics;
use crate::sync::stale::StaleTracker;
use crate::sync::watermarks::{Channel, WatermarkTable};

/// Persistence seam for operator skips (implemented by the logical index).
///
/// A skip marks one peer activity line as "treat as processed"; it survives
/// restarts so a persistent gap doesn't wedge the watermark forever.
pub trait SkipStore: Send + Sync {
    /// Whether a specific activity line has been skipped.
    fn is_skipped(&self, sd_id: &str, writer: &str, activity_seq: u64) -> bool;

    /// Record a skip.
    fn add_skip(
        &self,
        sd_id: &str,
        writer: &str,
        activity_seq: u64,
        note_id: Option<&str>,
    ) -> Result<()>;

    /// Clear skips for a writer, optionally scoped to one note.
    fn remove_skips(&self, sd_id: &str, writer: &str, note_id: Option<&str>) -> Result<()>;
}

/// Capability record the SD manager hands to [`ActivitySync`] at
/// construction. Keeps the sync logic free of store/index/event plumbing.
#[derive(Clone)]
pub struct SyncCallbacks {
    /// Reload one note from disk, emitting created/updated events as
    /// appropriate. Must fail on incomplete content so the caller retries.
    pub reload_note: Arc<dyn Fn(&str) -> Result<()> + Send + Sync>,

    /// Reload the folder tree from disk.
    pub reload_folders: Arc<dyn Fn() -> Result<()> + Send + Sync>,

    /// Forward a `note-deleted` activity entry to deletion reconciliation.
    pub process_remote_deletion: Arc<dyn Fn(&str) -> Result<()> + Send + Sync>,

    /// Does `notes/<note>/logs/<writer>_<seq>.crdtlog` exist?
    pub check_crdt_log_exists: Arc<dyn Fn(&str, &str, u64) -> bool + Send + Sync>,

    /// Does `folders/logs/<writer>_<seq>.crdtlog` exist?
    pub check_folders_log_exists: Arc<dyn Fn(&str, u64) -> bool + Send + Sync>,

    /// Highest CRDT log sequence visible for a peer at a target
    /// (None = folders). Feeds the `highest_seen` field of stale entries.
    pub highest_crdt_seq: Arc<dyn Fn(Option<&str>, &str) -> u64 + Send + Sync>,

    /// Notes currently materialized in memory (open editors etc.).
    pub get_loaded_notes: Arc<dyn Fn() -> Vec<String> + Send + Sync>,

    /// Does the note have any local presence (index or disk)?
    pub check_note_exists: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

/// Per-SD consumer of peer activity logs.
pub struct ActivitySync {
    fs: Arc<dyn FileSystem>,
    layout: SdLayout,
    sd_id: String,
    writer: WriterId,
    watermarks: Arc<WatermarkTable>,
    stale: Arc<StaleTracker>,
    skips: Arc<dyn SkipStore>,
    callbacks: SyncCallbacks,
    metrics: Arc<dyn SyncMetrics>,
}

impl ActivitySync {
    /// Build a sync consumer for one SD.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        layout: SdLayout,
        sd_id: String,
        writer: WriterId,
        watermarks: Arc<WatermarkTable>,
        stale: Arc<StaleTracker>,
        skips: Arc<dyn SkipStore>,
        callbacks: SyncCallbacks,
        metrics: Arc<dyn SyncMetrics>,
    ) -> Self {
        Self {
            fs,
            layout,
            sd_id,
            writer,
            watermarks,
            stale,
            skips,
            callbacks,
            metrics,
        }
    }

    /// The stale tracker for this SD.
    pub fn stale(&self) -> &Arc<StaleTracker> {
        &self.stale
    }

    /// Consume every peer's activity log past its watermark.
    ///
    /// Returns the set of note ids that were reloaded. Idempotent: with
    /// unchanged on-disk state a second call returns the empty set.
    pub fn sync_from_other_instances(&self) -> Result<BTreeSet<String>> {
        let started = Instant::now();
        let mut affected = BTreeSet::new();
        let mut processed = 0usize;

        let peers = self.enumerate_peers();
        for (writer_key, path) in peers {
            let watermark = self.watermarks.get(Channel::Activity, &writer_key);
            if watermark == 0 {
                self.metrics.full_scan();
            }

            let content = match self.fs.read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("skipping unreadable activity log {:?}: {}", path, e);
                    continue;
                }
            };

            let mut entries = parse_log(&content, ActivityEntry::parse);
            entries.retain(|e| e.sequence > watermark);
            entries.sort_by_key(|e| e.sequence);

            for entry in entries {
                if self.skips.is_skipped(&self.sd_id, &writer_key, entry.sequence) {
                    // Skipped stays skipped; treat as processed.
                    self.watermarks
                        .advance(Channel::Activity, &writer_key, entry.sequence);
                    self.stale.resolve_up_to(&writer_key, entry.writer_seq);
                    processed += 1;
                    continue;
                }

                match self.process_entry(&writer_key, &entry, &mut affected) {
                    EntryOutcome::Processed => {
                        self.watermarks
                            .advance(Channel::Activity, &writer_key, entry.sequence);
                        processed += 1;
                    }
                    EntryOutcome::Halt => break,
                }
            }
        }

        self.metrics.entries_processed(processed);
        self.metrics.sync_succeeded(started.elapsed());
        Ok(affected)
    }

    /// Activity logs of other writers, as (writer key, path).
    fn enumerate_peers(&self) -> Vec<(String, std::path::PathBuf)> {
        let Ok(paths) = self.fs.list_dir(&self.layout.activity_dir()) else {
            return Vec::new();
        };
        let mut peers = Vec::new();
        for path in paths {
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".log"))
            else {
                continue;
            };
            // Own file is excluded in both current and legacy name formats.
            if self.writer.matches_key(stem) {
                continue;
            }
            peers.push((stem.to_string(), path));
        }
        peers.sort();
        peers
    }

    fn process_entry(
        &self,
        writer_key: &str,
        entry: &ActivityEntry,
        affected: &mut BTreeSet<String>,
    ) -> EntryOutcome {
        match entry.kind {
            ActivityKind::NoteUpdate | ActivityKind::NoteCreated => {
                let Some(note_id) = entry.note_id.as_deref() else {
                    tracing::warn!("note activity entry without note id, skipping");
                    return EntryOutcome::Processed;
                };
                if !(self.callbacks.check_crdt_log_exists)(note_id, writer_key, entry.writer_seq) {
                    self.record_stale(Some(note_id), writer_key, entry);
                    return EntryOutcome::Halt;
                }
                match (self.callbacks.reload_note)(note_id) {
                    Ok(()) => {
                        affected.insert(note_id.to_string());
                        self.stale.resolve_up_to(writer_key, entry.writer_seq);
                        EntryOutcome::Processed
                    }
                    Err(e) => {
                        tracing::warn!("reload of {} failed: {}", note_id, e);
                        self.metrics.reload_timed_out();
                        self.record_stale(Some(note_id), writer_key, entry);
                        EntryOutcome::Halt
                    }
                }
            }
            ActivityKind::NoteDeleted => {
                let Some(note_id) = entry.note_id.as_deref() else {
                    return EntryOutcome::Processed;
                };
                // Deletions are terminal and idempotent; the watermark
                // advances even when cleanup partially fails.
                if let Err(e) = (self.callbacks.process_remote_deletion)(note_id) {
                    tracing::warn!("deletion reconciliation for {} failed: {}", note_id, e);
                }
                self.stale.resolve_note(note_id);
                EntryOutcome::Processed
            }
            ActivityKind::FolderUpdate => {
                if !(self.callbacks.check_folders_log_exists)(writer_key, entry.writer_seq) {
                    self.record_stale(None, writer_key, entry);
                    return EntryOutcome::Halt;
                }
                match (self.callbacks.reload_folders)() {
                    Ok(()) => {
                        self.stale.resolve_up_to(writer_key, entry.writer_seq);
                        EntryOutcome::Processed
                    }
                    Err(e) => {
                        tracing::warn!("folder tree reload failed: {}", e);
                        self.record_stale(None, writer_key, entry);
                        EntryOutcome::Halt
                    }
                }
            }
        }
    }

    fn record_stale(&self, note_id: Option<&str>, writer_key: &str, entry: &ActivityEntry) {
        let highest = (self.callbacks.highest_crdt_seq)(note_id, writer_key);
        self.stale
            .record(note_id, writer_key, entry.writer_seq, highest, entry.sequence);
        self.metrics.stale_recorded();
        tracing::info!(
            "stale sequence: note={:?} writer={} expected={} highest_seen={}",
            note_id,
            writer_key,
            entry.writer_seq,
            highest
        );
    }

    // ==================== Operator stale controls ====================

    /// Skip the stale lines of one note from one peer. Recorded
    /// persistently; subsequent cycles treat the lines as processed.
    pub fn skip_stale_entry(&self, note_id: &str, source_writer: &str) -> Result<()> {
        for entry in self.stale.entries() {
            if entry.note_id.as_deref() == Some(note_id) && entry.source_writer == source_writer {
                self.skips.add_skip(
                    &self.sd_id,
                    source_writer,
                    entry.activity_seq,
                    Some(note_id),
                )?;
            }
        }
        self.stale.resolve_note(note_id);
        Ok(())
    }

    /// Clear skips for one note from one peer and force a recheck on the
    /// next cycle.
    pub fn retry_stale_entry(&self, note_id: &str, source_writer: &str) -> Result<()> {
        self.skips
            .remove_skips(&self.sd_id, source_writer, Some(note_id))
    }
}

enum EntryOutcome {
    Processed,
    Halt,
}
