//! Cross-SD note move: a journaled state machine with crash recovery.
//!
//! Moving a note between two storage directories of the same host
//! installation walks the chain
//! `initiated → copying → files_copied → db_updated → cleaning → completed`,
//! persisting every transition in the move journal. From any non-terminal
//! state an error diverges to `rolled_back`; `cancelled` is reachable from
//! `initiated` only. On startup, non-terminal rows initiated by this host
//! resume where they left off; another host's stale rows can be taken over
//! when both SDs are reachable.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{NotefoldError, Result};
use crate::fs::{copy_dir_recursive, FileSystem};
use crate::index::{LogicalIndex, MoveRow};
use crate::sd::SdLayout;
use crate::sync::DeletionLogger;

/// A row of another host is eligible for takeover after this much silence.
const TAKEOVER_STALE_MS: i64 = 5 * 60 * 1000;

/// Terminal rows are kept this long for diagnostics.
const RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// States of the move state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    /// Row persisted, nothing copied yet.
    Initiated,
    /// Copying note files into the target's staging directory.
    Copying,
    /// Staging complete; renaming into the final note directory.
    FilesCopied,
    /// Logical index re-homed; source deletion log written.
    DbUpdated,
    /// Removing the source note directory.
    Cleaning,
    /// Done.
    Completed,
    /// Aborted before any work happened.
    Cancelled,
    /// Undone after an error.
    RolledBack,
}

impl MoveState {
    /// Whether this state ends the machine.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoveState::Completed | MoveState::Cancelled | MoveState::RolledBack
        )
    }

    /// Legal transitions. Everything else is rejected.
    pub fn can_transition_to(&self, next: MoveState) -> bool {
        use MoveState::*;
        match (self, next) {
            (Initiated, Copying)
            | (Copying, FilesCopied)
            | (FilesCopied, DbUpdated)
            | (DbUpdated, Cleaning)
            | (Cleaning, Completed) => true,
            (Initiated, Cancelled) => true,
            (from, RolledBack) => !from.is_terminal(),
            _ => false,
        }
    }

    /// The state tag stored in the journal.
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveState::Initiated => "initiated",
            MoveState::Copying => "copying",
            MoveState::FilesCopied => "files_copied",
            MoveState::DbUpdated => "db_updated",
            MoveState::Cleaning => "cleaning",
            MoveState::Completed => "completed",
            MoveState::Cancelled => "cancelled",
            MoveState::RolledBack => "rolled_back",
        }
    }

    /// Tags of the terminal states, for journal queries.
    pub fn terminal_tags() -> [&'static str; 3] {
        ["completed", "cancelled", "rolled_back"]
    }

    /// Tags of the non-terminal states, for journal queries.
    pub fn pending_tags() -> [&'static str; 5] {
        ["initiated", "copying", "files_copied", "db_updated", "cleaning"]
    }
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MoveState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(MoveState::Initiated),
            "copying" => Ok(MoveState::Copying),
            "files_copied" => Ok(MoveState::FilesCopied),
            "db_updated" => Ok(MoveState::DbUpdated),
            "cleaning" => Ok(MoveState::Cleaning),
            "completed" => Ok(MoveState::Completed),
            "cancelled" => Ok(MoveState::Cancelled),
            "rolled_back" => Ok(MoveState::RolledBack),
            other => Err(format!("unknown move state: {other:?}")),
        }
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Rows this host resumed and drove to completion.
    pub resumed: Vec<String>,
    /// Stale foreign rows this host took over.
    pub taken_over: Vec<String>,
    /// Foreign rows left alone (not stale, or SDs unreachable); surfaced to
    /// the operator.
    pub surfaced: Vec<MoveRow>,
}

/// Executes and recovers cross-SD moves.
pub struct MoveExecutor {
    fs: Arc<dyn FileSystem>,
    index: Arc<LogicalIndex>,
    /// Writer key used for the source SD's deletion log entry.
    writer_key: String,
    /// Instance id identifying this host in `initiated_by`.
    host_id: String,
}

impl MoveExecutor {
    /// Create an executor.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        index: Arc<LogicalIndex>,
        writer_key: String,
        host_id: String,
    ) -> Self {
        Self {
            fs,
            index,
            writer_key,
            host_id,
        }
    }

    /// Start and run a move to completion. Returns the journal row id.
    pub fn execute_move(
        &self,
        note_id: &str,
        source_sd_uuid: &str,
        source_root: &Path,
        target_sd_uuid: &str,
        target_root: &Path,
        target_folder_id: Option<&str>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        self.index.insert_move(&MoveRow {
            id: id.clone(),
            note_id: note_id.to_string(),
            source_sd_uuid: source_sd_uuid.to_string(),
            target_sd_uuid: target_sd_uuid.to_string(),
            target_folder_id: target_folder_id.map(String::from),
            state: MoveState::Initiated.as_str().to_string(),
            initiated_by: self.host_id.clone(),
            initiated_at: now,
            last_modified: now,
            source_sd_path: source_root.to_path_buf(),
            target_sd_path: target_root.to_path_buf(),
            error: None,
        })?;
        self.resume(&id)?;
        Ok(id)
    }

    /// Cancel a move that hasn't started copying yet.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let row = self.fetch(id)?;
        self.transition(&row, MoveState::Cancelled, None)?;
        Ok(())
    }

    /// Drive a journal row from its current state to a terminal one.
    /// Steps are idempotent, so resuming after a crash redoes at most one
    /// step.
    pub fn resume(&self, id: &str) -> Result<()> {
        loop {
            let row = self.fetch(id)?;
            let state = self.parse_state(&row)?;
            if state.is_terminal() {
                return Ok(());
            }
            if let Err(e) = self.step(&row, state) {
                tracing::warn!("move {} failed in state {}: {}; rolling back", id, state, e);
                self.rollback(id, &e.to_string())?;
                return Err(e);
            }
        }
    }

    /// Perform the work of one state and advance.
    fn step(&self, row: &MoveRow, state: MoveState) -> Result<()> {
        let source = SdLayout::new(&row.source_sd_path);
        let target = SdLayout::new(&row.target_sd_path);
        let staging = target.note_staging_dir(&row.note_id);
        let final_dir = target.note_dir(&row.note_id);
        let source_dir = source.note_dir(&row.note_id);

        match state {
            MoveState::Initiated => {
                self.transition(row, MoveState::Copying, None)?;
            }
            MoveState::Copying => {
                // Restarted copies begin from a clean staging dir.
                if self.fs.exists(&staging) {
                    self.fs.remove_dir_all(&staging)?;
                }
                if self.fs.exists(&source_dir) {
                    copy_dir_recursive(self.fs.as_ref(), &source_dir, &staging)?;
                } else if !self.fs.exists(&final_dir) {
                    return Err(NotefoldError::RestoreFailed(format!(
                        "note {} has no files at the source",
                        row.note_id
                    )));
                }
                self.transition(row, MoveState::FilesCopied, None)?;
            }
            MoveState::FilesCopied => {
                if self.fs.exists(&staging) {
                    self.fs.sync_file(&staging).ok();
                    if self.fs.exists(&final_dir) {
                        self.fs.remove_dir_all(&final_dir)?;
                    }
                    self.fs.rename(&staging, &final_dir)?;
                }
                self.transition(row, MoveState::DbUpdated, None)?;
            }
            MoveState::DbUpdated => {
                self.index.set_note_sd(
                    &row.note_id,
                    &row.target_sd_uuid,
                    row.target_folder_id.as_deref(),
                )?;
                // Peers watching the source SD drop the note through the
                // deletion channel.
                let deletion_log =
                    DeletionLogger::new(self.fs.clone(), source.deletion_log(&self.writer_key));
                deletion_log.record(&row.note_id)?;
                self.transition(row, MoveState::Cleaning, None)?;
            }
            MoveState::Cleaning => {
                if self.fs.exists(&source_dir) {
                    self.fs.remove_dir_all(&source_dir)?;
                }
                self.transition(row, MoveState::Completed, None)?;
            }
            MoveState::Completed | MoveState::Cancelled | MoveState::RolledBack => {}
        }
        Ok(())
    }

    /// Undo a failed move. Idempotent.
    pub fn rollback(&self, id: &str, reason: &str) -> Result<()> {
        let row = self.fetch(id)?;
        let state = self.parse_state(&row)?;
        if state.is_terminal() {
            return Ok(());
        }

        let source = SdLayout::new(&row.source_sd_path);
        let target = SdLayout::new(&row.target_sd_path);
        let staging = target.note_staging_dir(&row.note_id);
        let final_dir = target.note_dir(&row.note_id);
        let source_dir = source.note_dir(&row.note_id);

        if self.fs.exists(&staging) {
            self.fs.remove_dir_all(&staging)?;
        }
        if matches!(state, MoveState::DbUpdated | MoveState::Cleaning) {
            // Revert the index to the source SD.
            self.index.set_note_sd(&row.note_id, &row.source_sd_uuid, None)?;
        }
        if state == MoveState::Cleaning && !self.fs.exists(&source_dir) {
            // Source partially (or fully) deleted; the target copy is still
            // intact until `completed`, so restore from it.
            if self.fs.exists(&final_dir) {
                copy_dir_recursive(self.fs.as_ref(), &final_dir, &source_dir)?;
            }
        }
        if matches!(
            state,
            MoveState::FilesCopied | MoveState::DbUpdated | MoveState::Cleaning
        ) && self.fs.exists(&final_dir)
            && self.fs.exists(&source_dir)
        {
            self.fs.remove_dir_all(&final_dir)?;
        }

        self.transition(&row, MoveState::RolledBack, Some(reason))?;
        Ok(())
    }

    // ==================== Recovery ====================

    /// Startup recovery: resume this host's rows, take over stale foreign
    /// rows whose SDs are reachable, surface the rest.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let pending = self
            .index
            .list_moves_in_states(&MoveState::pending_tags())?;
        let now = chrono::Utc::now().timestamp_millis();

        for row in pending {
            if row.initiated_by == self.host_id {
                match self.resume(&row.id) {
                    Ok(()) => report.resumed.push(row.id),
                    Err(e) => tracing::warn!("recovery of move {} failed: {}", row.id, e),
                }
                continue;
            }

            let stale = now - row.last_modified > TAKEOVER_STALE_MS;
            let reachable =
                self.fs.exists(&row.source_sd_path) && self.fs.exists(&row.target_sd_path);
            if stale && reachable {
                match self.take_over_move(&row.id) {
                    Ok(()) => report.taken_over.push(row.id),
                    Err(e) => {
                        tracing::warn!("takeover of move {} failed: {}", row.id, e);
                        report.surfaced.push(row);
                    }
                }
            } else {
                report.surfaced.push(row);
            }
        }

        self.index
            .purge_terminal_moves(&MoveState::terminal_tags(), now - RETENTION_MS)?;
        Ok(report)
    }

    /// Adopt another host's stale row and drive it to completion.
    ///
    /// Permitted only when both SDs are accessible to this host.
    pub fn take_over_move(&self, id: &str) -> Result<()> {
        let row = self.fetch(id)?;
        if !self.fs.exists(&row.source_sd_path) || !self.fs.exists(&row.target_sd_path) {
            return Err(NotefoldError::RestoreFailed(format!(
                "cannot take over move {id}: source or target SD is not accessible"
            )));
        }
        self.index.reassign_move(id, &self.host_id)?;
        self.resume(id)
    }

    // ==================== Journal plumbing ====================

    fn fetch(&self, id: &str) -> Result<MoveRow> {
        self.index.get_move(id)?.ok_or_else(|| NotefoldError::InvalidId {
            value: id.to_string(),
            message: "unknown move journal row".to_string(),
        })
    }

    fn parse_state(&self, row: &MoveRow) -> Result<MoveState> {
        row.state
            .parse()
            .map_err(|_| NotefoldError::InvalidStateTransition {
                from: row.state.clone(),
                to: "?".to_string(),
            })
    }

    /// Validated, persisted transition.
    fn transition(&self, row: &MoveRow, to: MoveState, error: Option<&str>) -> Result<()> {
        let from = self.parse_state(row)?;
        if !from.can_transition_to(to) {
            return Err(NotefoldError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.index.update_move_state(&row.id, to.as_str(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::index::NoteRecord;
    use std::path::PathBuf;

    const NOTE: &str = "00000000-0000-4000-8000-000000000001";

    struct Fixture {
        fs: Arc<InMemoryFileSystem>,
        index: Arc<LogicalIndex>,
        executor: MoveExecutor,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(InMemoryFileSystem::new());
        let index = Arc::new(LogicalIndex::in_memory().unwrap());

        // Note files at the source.
        fs.write(
            &PathBuf::from(format!("/src/notes/{NOTE}/snapshot.yjs")),
            b"\x01snap",
        )
        .unwrap();
        fs.write(
            &PathBuf::from(format!("/src/notes/{NOTE}/logs/w_1.crdtlog")),
            b"log",
        )
        .unwrap();
        fs.create_dir_all(&PathBuf::from("/dst/notes")).unwrap();

        index
            .upsert_note(&NoteRecord {
                note_id: NOTE.to_string(),
                sd_uuid: "src-uuid".to_string(),
                title: "Moving".to_string(),
                folder_id: None,
                created_at: 0,
                modified_at: 0,
                deleted: false,
            })
            .unwrap();

        let executor = MoveExecutor::new(
            fs.clone(),
            index.clone(),
            "prof_inst".to_string(),
            "inst".to_string(),
        );
        Fixture {
            fs,
            index,
            executor,
        }
    }

    fn run_move(f: &Fixture) -> String {
        f.executor
            .execute_move(
                NOTE,
                "src-uuid",
                Path::new("/src"),
                "dst-uuid",
                Path::new("/dst"),
                Some("f-1"),
            )
            .unwrap()
    }

    #[test]
    fn test_reachable_states_only() {
        use MoveState::*;
        assert!(Initiated.can_transition_to(Copying));
        assert!(Initiated.can_transition_to(Cancelled));
        assert!(Copying.can_transition_to(FilesCopied));
        assert!(Cleaning.can_transition_to(Completed));
        assert!(DbUpdated.can_transition_to(RolledBack));

        // Rejected edges
        assert!(!Initiated.can_transition_to(FilesCopied));
        assert!(!Copying.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(RolledBack));
        assert!(!Completed.can_transition_to(Copying));
        assert!(!Cancelled.can_transition_to(Copying));
    }

    #[test]
    fn test_happy_path_move() {
        let f = fixture();
        let id = run_move(&f);

        let row = f.index.get_move(&id).unwrap().unwrap();
        assert_eq!(row.state, "completed");

        // Files moved, staging gone, source gone.
        assert!(f
            .fs
            .exists(&PathBuf::from(format!("/dst/notes/{NOTE}/snapshot.yjs"))));
        assert!(f
            .fs
            .exists(&PathBuf::from(format!("/dst/notes/{NOTE}/logs/w_1.crdtlog"))));
        assert!(!f.fs.exists(&PathBuf::from(format!("/dst/notes/.moving-{NOTE}"))));
        assert!(!f.fs.exists(&PathBuf::from(format!("/src/notes/{NOTE}"))));

        // Index re-homed; deletion advertised in the source SD.
        let note = f.index.get_note(NOTE).unwrap().unwrap();
        assert_eq!(note.sd_uuid, "dst-uuid");
        assert_eq!(note.folder_id.as_deref(), Some("f-1"));
        assert!(f.fs.exists(&PathBuf::from("/src/deleted/prof_inst.log")));
    }

    #[test]
    fn test_crash_mid_cleaning_recovers_to_completed() {
        let f = fixture();

        // Drive manually to `cleaning`, then simulate the crash: target
        // files exist, source partially deleted, row non-terminal.
        let id = run_move(&f);
        let mut row = f.index.get_move(&id).unwrap().unwrap();
        row.id = "m-crashed".to_string();
        row.state = "cleaning".to_string();
        row.initiated_by = "inst".to_string();
        f.index.insert_move(&row).unwrap();
        // Source leftovers from the interrupted delete.
        f.fs.write(
            &PathBuf::from(format!("/src/notes/{NOTE}/logs/w_1.crdtlog")),
            b"leftover",
        )
        .unwrap();

        let report = f.executor.recover().unwrap();
        assert!(report.resumed.contains(&"m-crashed".to_string()));

        let row = f.index.get_move("m-crashed").unwrap().unwrap();
        assert_eq!(row.state, "completed");
        assert!(!f.fs.exists(&PathBuf::from(format!("/src/notes/{NOTE}"))));
        assert!(f.fs.exists(&PathBuf::from(format!("/dst/notes/{NOTE}/snapshot.yjs"))));
    }

    #[test]
    fn test_rollback_from_db_updated_reverts_index() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp_millis();
        f.index
            .insert_move(&MoveRow {
                id: "m-1".to_string(),
                note_id: NOTE.to_string(),
                source_sd_uuid: "src-uuid".to_string(),
                target_sd_uuid: "dst-uuid".to_string(),
                target_folder_id: None,
                state: "db_updated".to_string(),
                initiated_by: "inst".to_string(),
                initiated_at: now,
                last_modified: now,
                source_sd_path: PathBuf::from("/src"),
                target_sd_path: PathBuf::from("/dst"),
                error: None,
            })
            .unwrap();
        // Pretend the copy completed and the index was re-homed.
        f.fs.write(
            &PathBuf::from(format!("/dst/notes/{NOTE}/snapshot.yjs")),
            b"\x01snap",
        )
        .unwrap();
        f.index.set_note_sd(NOTE, "dst-uuid", None).unwrap();

        f.executor.rollback("m-1", "disk full").unwrap();

        let row = f.index.get_move("m-1").unwrap().unwrap();
        assert_eq!(row.state, "rolled_back");
        assert_eq!(row.error.as_deref(), Some("disk full"));
        assert_eq!(f.index.get_note(NOTE).unwrap().unwrap().sd_uuid, "src-uuid");
        // Target copy removed since the source is intact.
        assert!(!f.fs.exists(&PathBuf::from(format!("/dst/notes/{NOTE}"))));

        // Rollback is idempotent.
        f.executor.rollback("m-1", "again").unwrap();
    }

    #[test]
    fn test_cancel_only_from_initiated() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp_millis();
        let row = MoveRow {
            id: "m-1".to_string(),
            note_id: NOTE.to_string(),
            source_sd_uuid: "src-uuid".to_string(),
            target_sd_uuid: "dst-uuid".to_string(),
            target_folder_id: None,
            state: "initiated".to_string(),
            initiated_by: "inst".to_string(),
            initiated_at: now,
            last_modified: now,
            source_sd_path: PathBuf::from("/src"),
            target_sd_path: PathBuf::from("/dst"),
            error: None,
        };
        f.index.insert_move(&row).unwrap();
        f.executor.cancel("m-1").unwrap();
        assert_eq!(f.index.get_move("m-1").unwrap().unwrap().state, "cancelled");

        let mut row2 = row;
        row2.id = "m-2".to_string();
        row2.state = "copying".to_string();
        f.index.insert_move(&row2).unwrap();
        assert!(matches!(
            f.executor.cancel("m-2"),
            Err(NotefoldError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_foreign_fresh_row_is_surfaced_not_taken() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp_millis();
        f.index
            .insert_move(&MoveRow {
                id: "m-other".to_string(),
                note_id: NOTE.to_string(),
                source_sd_uuid: "src-uuid".to_string(),
                target_sd_uuid: "dst-uuid".to_string(),
                target_folder_id: None,
                state: "copying".to_string(),
                initiated_by: "other-host".to_string(),
                initiated_at: now,
                last_modified: now,
                source_sd_path: PathBuf::from("/src"),
                target_sd_path: PathBuf::from("/dst"),
                error: None,
            })
            .unwrap();

        let report = f.executor.recover().unwrap();
        assert!(report.taken_over.is_empty());
        assert_eq!(report.surfaced.len(), 1);
        assert_eq!(report.surfaced[0].id, "m-other");
    }

    #[test]
    fn test_stale_foreign_row_taken_over() {
        let f = fixture();
        let stale_time = chrono::Utc::now().timestamp_millis() - TAKEOVER_STALE_MS - 1000;
        f.index
            .insert_move(&MoveRow {
                id: "m-stale".to_string(),
                note_id: NOTE.to_string(),
                source_sd_uuid: "src-uuid".to_string(),
                target_sd_uuid: "dst-uuid".to_string(),
                target_folder_id: None,
                state: "initiated".to_string(),
                initiated_by: "other-host".to_string(),
                initiated_at: stale_time,
                last_modified: stale_time,
                source_sd_path: PathBuf::from("/src"),
                target_sd_path: PathBuf::from("/dst"),
                error: None,
            })
            .unwrap();

        let report = f.executor.recover().unwrap();
        assert_eq!(report.taken_over, vec!["m-stale".to_string()]);
        let row = f.index.get_move("m-stale").unwrap().unwrap();
        assert_eq!(row.state, "completed");
        assert_eq!(row.initiated_by, "inst");
    }
}
