//! Logical index: the per-profile process-state database.
//!
//! SQLite-backed registry of storage directories, a queryable cache of note
//! metadata (so list surfaces don't load CRDTs), persisted watermarks and
//! stale skips, the cross-SD move journal, and instance settings.
//!
//! # Thread Safety
//!
//! The connection is wrapped in a `Mutex` for thread-safe access.
//! SQLite itself is used in serialized threading mode.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{NotefoldError, Result};
use crate::sync::{SkipStore, WatermarkStore};

/// A registered storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdRecord {
    /// The SD's UUID (contents of its `SD_ID` file).
    pub uuid: String,
    /// Operator-facing name. Unique across registered SDs.
    pub name: String,
    /// Absolute path of the SD root. Unique across registered SDs.
    pub path: PathBuf,
    /// Layout version (contents of `SD_VERSION`).
    pub version: i64,
    /// Unix timestamp of registration (milliseconds).
    pub added_at: i64,
}

/// One note's cached metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord {
    /// Note UUID.
    pub note_id: String,
    /// The SD that owns the note.
    pub sd_uuid: String,
    /// Cached title.
    pub title: String,
    /// Cached folder placement.
    pub folder_id: Option<String>,
    /// Creation time (unix milliseconds).
    pub created_at: i64,
    /// Last modification time (unix milliseconds).
    pub modified_at: i64,
    /// Permanent-deletion tombstone. Files may lag behind this flag.
    pub deleted: bool,
}

/// One row of the cross-SD move journal. The state machine semantics live
/// in [`crate::moves`]; the index only stores and retrieves rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRow {
    /// Journal row id.
    pub id: String,
    /// The note being moved.
    pub note_id: String,
    /// Source SD UUID.
    pub source_sd_uuid: String,
    /// Target SD UUID.
    pub target_sd_uuid: String,
    /// Folder in the target SD the note lands in.
    pub target_folder_id: Option<String>,
    /// Current state tag.
    pub state: String,
    /// Instance id of the initiating host.
    pub initiated_by: String,
    /// When the move started (unix milliseconds).
    pub initiated_at: i64,
    /// Last state change (unix milliseconds).
    pub last_modified: i64,
    /// Source SD root path at initiation time.
    pub source_sd_path: PathBuf,
    /// Target SD root path at initiation time.
    pub target_sd_path: PathBuf,
    /// Error message if the move failed.
    pub error: Option<String>,
}

/// SQLite-backed logical index.
pub struct LogicalIndex {
    conn: Mutex<Connection>,
}

impl LogicalIndex {
    /// Open or create the index database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// Create an in-memory index for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// Initialize the database schema. Idempotent.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Registered storage directories
            CREATE TABLE IF NOT EXISTS sds (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL UNIQUE,
                version INTEGER NOT NULL,
                added_at INTEGER NOT NULL
            );

            -- Note metadata cache (queryable without loading CRDTs)
            CREATE TABLE IF NOT EXISTS notes (
                note_id TEXT PRIMARY KEY,
                sd_uuid TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                folder_id TEXT,
                created_at INTEGER NOT NULL DEFAULT 0,
                modified_at INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_notes_sd ON notes(sd_uuid, deleted);

            -- Per-(sd, channel, peer-writer) consumed sequences
            CREATE TABLE IF NOT EXISTS watermarks (
                sd_uuid TEXT NOT NULL,
                channel TEXT NOT NULL,
                writer TEXT NOT NULL,
                seq INTEGER NOT NULL,
                PRIMARY KEY (sd_uuid, channel, writer)
            );

            -- Operator-skipped stale activity lines
            CREATE TABLE IF NOT EXISTS stale_skips (
                sd_uuid TEXT NOT NULL,
                writer TEXT NOT NULL,
                activity_seq INTEGER NOT NULL,
                note_id TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (sd_uuid, writer, activity_seq)
            );

            -- Cross-SD move journal
            CREATE TABLE IF NOT EXISTS move_journal (
                id TEXT PRIMARY KEY,
                note_id TEXT NOT NULL,
                source_sd_uuid TEXT NOT NULL,
                target_sd_uuid TEXT NOT NULL,
                target_folder_id TEXT,
                state TEXT NOT NULL,
                initiated_by TEXT NOT NULL,
                initiated_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                source_sd_path TEXT NOT NULL,
                target_sd_path TEXT NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_move_journal_state ON move_journal(state);

            -- Instance settings (small key/value pairs)
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ==================== Storage directories ====================

    /// Register an SD, failing with [`NotefoldError::ConflictingSd`] naming
    /// the existing owner when the UUID, name, or path is already taken.
    pub fn register_sd(&self, uuid: &str, name: &str, path: &Path, version: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let path_str = path.to_string_lossy().to_string();

        // Name the offender rather than surfacing a bare UNIQUE violation.
        let conflict = conn
            .query_row(
                "SELECT uuid, name, path FROM sds WHERE uuid = ?1 OR name = ?2 OR path = ?3",
                params![uuid, name, path_str],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        if let Some((ex_uuid, ex_name, ex_path)) = conflict {
            let message = if ex_uuid == uuid {
                format!("UUID {uuid} is already registered")
            } else if ex_name == name {
                format!("name '{name}' is already in use")
            } else {
                format!("path '{path_str}' is already registered")
            };
            return Err(NotefoldError::ConflictingSd {
                message,
                existing_name: ex_name,
                existing_path: PathBuf::from(ex_path),
            });
        }

        conn.execute(
            "INSERT INTO sds (uuid, name, path, version, added_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid,
                name,
                path_str,
                version,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Remove an SD registration along with its watermarks, skips, and note
    /// cache rows.
    pub fn unregister_sd(&self, uuid: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sds WHERE uuid = ?1", params![uuid])?;
        conn.execute("DELETE FROM notes WHERE sd_uuid = ?1", params![uuid])?;
        conn.execute("DELETE FROM watermarks WHERE sd_uuid = ?1", params![uuid])?;
        conn.execute("DELETE FROM stale_skips WHERE sd_uuid = ?1", params![uuid])?;
        Ok(())
    }

    /// Fetch one registered SD.
    pub fn get_sd(&self, uuid: &str) -> Result<Option<SdRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uuid, name, path, version, added_at FROM sds WHERE uuid = ?1",
            params![uuid],
            sd_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All registered SDs, ordered by name.
    pub fn list_sds(&self) -> Result<Vec<SdRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT uuid, name, path, version, added_at FROM sds ORDER BY name")?;
        let rows = stmt
            .query_map([], sd_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ==================== Note cache ====================

    /// Insert or update a note's cached metadata.
    pub fn upsert_note(&self, note: &NoteRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO notes
             (note_id, sd_uuid, title, folder_id, created_at, modified_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                note.note_id,
                note.sd_uuid,
                note.title,
                note.folder_id,
                note.created_at,
                note.modified_at,
                note.deleted as i64
            ],
        )?;
        Ok(())
    }

    /// Fetch one note's cached metadata.
    pub fn get_note(&self, note_id: &str) -> Result<Option<NoteRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT note_id, sd_uuid, title, folder_id, created_at, modified_at, deleted
             FROM notes WHERE note_id = ?1",
            params![note_id],
            note_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Live (non-deleted) notes of one SD, ordered by modification time
    /// descending.
    pub fn list_notes(&self, sd_uuid: &str) -> Result<Vec<NoteRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT note_id, sd_uuid, title, folder_id, created_at, modified_at, deleted
             FROM notes WHERE sd_uuid = ?1 AND deleted = 0 ORDER BY modified_at DESC",
        )?;
        let rows = stmt
            .query_map(params![sd_uuid], note_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Mark a note permanently deleted (terminal).
    pub fn mark_note_deleted(&self, note_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notes SET deleted = 1, modified_at = ?2 WHERE note_id = ?1",
            params![note_id, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Re-home a note to a different SD (used by the move executor).
    pub fn set_note_sd(&self, note_id: &str, sd_uuid: &str, folder_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notes SET sd_uuid = ?2, folder_id = ?3, modified_at = ?4 WHERE note_id = ?1",
            params![
                note_id,
                sd_uuid,
                folder_id,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Remove a note row entirely.
    pub fn remove_note(&self, note_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM notes WHERE note_id = ?1", params![note_id])?;
        Ok(())
    }

    /// Notes marked deleted whose files may still linger, for the startup
    /// cleanup sweep.
    pub fn list_deleted_notes(&self, sd_uuid: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT note_id FROM notes WHERE sd_uuid = ?1 AND deleted = 1")?;
        let rows = stmt
            .query_map(params![sd_uuid], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ==================== Move journal ====================

    /// Insert a new move journal row.
    pub fn insert_move(&self, row: &MoveRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO move_journal
             (id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
              initiated_by, initiated_at, last_modified, source_sd_path, target_sd_path, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.id,
                row.note_id,
                row.source_sd_uuid,
                row.target_sd_uuid,
                row.target_folder_id,
                row.state,
                row.initiated_by,
                row.initiated_at,
                row.last_modified,
                row.source_sd_path.to_string_lossy(),
                row.target_sd_path.to_string_lossy(),
                row.error
            ],
        )?;
        Ok(())
    }

    /// Fetch one move journal row.
    pub fn get_move(&self, id: &str) -> Result<Option<MoveRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
                    initiated_by, initiated_at, last_modified, source_sd_path, target_sd_path, error
             FROM move_journal WHERE id = ?1",
            params![id],
            move_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Update a row's state (and error), stamping `last_modified`.
    pub fn update_move_state(&self, id: &str, state: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE move_journal SET state = ?2, error = ?3, last_modified = ?4 WHERE id = ?1",
            params![id, state, error, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Reassign a row to a different initiating host (move takeover).
    pub fn reassign_move(&self, id: &str, host: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE move_journal SET initiated_by = ?2, last_modified = ?3 WHERE id = ?1",
            params![id, host, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// All rows currently in one of the given states.
    pub fn list_moves_in_states(&self, states: &[&str]) -> Result<Vec<MoveRow>> {
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> = (1..=states.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT id, note_id, source_sd_uuid, target_sd_uuid, target_folder_id, state,
                    initiated_by, initiated_at, last_modified, source_sd_path, target_sd_path, error
             FROM move_journal WHERE state IN ({}) ORDER BY initiated_at",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(states.iter()), move_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Delete terminal rows older than the cutoff. Returns how many were
    /// removed.
    pub fn purge_terminal_moves(&self, terminal_states: &[&str], cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> = (2..=terminal_states.len() + 1)
            .map(|i| format!("?{i}"))
            .collect();
        let sql = format!(
            "DELETE FROM move_journal WHERE last_modified < ?1 AND state IN ({})",
            placeholders.join(", ")
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff_ms)];
        for state in terminal_states {
            params_vec.push(Box::new(state.to_string()));
        }
        let removed = conn.execute(
            &sql,
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
        )?;
        Ok(removed)
    }

    // ==================== Settings ====================

    /// Read one setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Write one setting.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn sd_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SdRecord> {
    Ok(SdRecord {
        uuid: row.get(0)?,
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        version: row.get(3)?,
        added_at: row.get(4)?,
    })
}

fn note_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteRecord> {
    Ok(NoteRecord {
        note_id: row.get(0)?,
        sd_uuid: row.get(1)?,
        title: row.get(2)?,
        folder_id: row.get(3)?,
        created_at: row.get(4)?,
        modified_at: row.get(5)?,
        deleted: row.get::<_, i64>(6)? != 0,
    })
}

fn move_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MoveRow> {
    Ok(MoveRow {
        id: row.get(0)?,
        note_id: row.get(1)?,
        source_sd_uuid: row.get(2)?,
        target_sd_uuid: row.get(3)?,
        target_folder_id: row.get(4)?,
        state: row.get(5)?,
        initiated_by: row.get(6)?,
        initiated_at: row.get(7)?,
        last_modified: row.get(8)?,
        source_sd_path: PathBuf::from(row.get::<_, String>(9)?),
        target_sd_path: PathBuf::from(row.get::<_, String>(10)?),
        error: row.get(11)?,
    })
}

impl WatermarkStore for LogicalIndex {
    fn load_watermarks(&self, sd_id: &str) -> Result<Vec<(String, String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT channel, writer, seq FROM watermarks WHERE sd_uuid = ?1")?;
        let rows = stmt
            .query_map(params![sd_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn save_watermark(&self, sd_id: &str, channel: &str, writer: &str, seq: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO watermarks (sd_uuid, channel, writer, seq)
             VALUES (?1, ?2, ?3, ?4)",
            params![sd_id, channel, writer, seq as i64],
        )?;
        Ok(())
    }
}

impl SkipStore for LogicalIndex {
    fn is_skipped(&self, sd_id: &str, writer: &str, activity_seq: u64) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM stale_skips WHERE sd_uuid = ?1 AND writer = ?2 AND activity_seq = ?3",
            params![sd_id, writer, activity_seq as i64],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
        .unwrap_or(false)
    }

    fn add_skip(
        &self,
        sd_id: &str,
        writer: &str,
        activity_seq: u64,
        note_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO stale_skips (sd_uuid, writer, activity_seq, note_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sd_id,
                writer,
                activity_seq as i64,
                note_id,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn remove_skips(&self, sd_id: &str, writer: &str, note_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match note_id {
            Some(note_id) => conn.execute(
                "DELETE FROM stale_skips WHERE sd_uuid = ?1 AND writer = ?2 AND note_id = ?3",
                params![sd_id, writer, note_id],
            )?,
            None => conn.execute(
                "DELETE FROM stale_skips WHERE sd_uuid = ?1 AND writer = ?2",
                params![sd_id, writer],
            )?,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> LogicalIndex {
        LogicalIndex::in_memory().unwrap()
    }

    #[test]
    fn test_register_sd_conflicts_name_uuid_path() {
        let idx = index();
        idx.register_sd("u1", "Work", Path::new("/a"), 1).unwrap();

        // Same UUID
        let err = idx.register_sd("u1", "Other", Path::new("/b"), 1).unwrap_err();
        match err {
            NotefoldError::ConflictingSd {
                message,
                existing_name,
                ..
            } => {
                assert!(message.contains("u1"));
                assert_eq!(existing_name, "Work");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Same name
        assert!(matches!(
            idx.register_sd("u2", "Work", Path::new("/b"), 1),
            Err(NotefoldError::ConflictingSd { .. })
        ));

        // Same path
        assert!(matches!(
            idx.register_sd("u2", "Other", Path::new("/a"), 1),
            Err(NotefoldError::ConflictingSd { .. })
        ));

        // All distinct: fine
        idx.register_sd("u2", "Other", Path::new("/b"), 1).unwrap();
        assert_eq!(idx.list_sds().unwrap().len(), 2);
    }

    #[test]
    fn test_unregister_cleans_dependents() {
        let idx = index();
        idx.register_sd("u1", "Work", Path::new("/a"), 1).unwrap();
        idx.save_watermark("u1", "activity", "peer", 3).unwrap();
        idx.add_skip("u1", "peer", 4, Some("n-1")).unwrap();

        idx.unregister_sd("u1").unwrap();
        assert!(idx.get_sd("u1").unwrap().is_none());
        assert!(idx.load_watermarks("u1").unwrap().is_empty());
        assert!(!idx.is_skipped("u1", "peer", 4));
    }

    #[test]
    fn test_note_cache_round_trip() {
        let idx = index();
        let note = NoteRecord {
            note_id: "n-1".into(),
            sd_uuid: "u1".into(),
            title: "Groceries".into(),
            folder_id: Some("f-1".into()),
            created_at: 1,
            modified_at: 2,
            deleted: false,
        };
        idx.upsert_note(&note).unwrap();
        assert_eq!(idx.get_note("n-1").unwrap().unwrap(), note);

        idx.mark_note_deleted("n-1").unwrap();
        assert!(idx.get_note("n-1").unwrap().unwrap().deleted);
        assert!(idx.list_notes("u1").unwrap().is_empty());
        assert_eq!(idx.list_deleted_notes("u1").unwrap(), vec!["n-1"]);
    }

    #[test]
    fn test_set_note_sd() {
        let idx = index();
        idx.upsert_note(&NoteRecord {
            note_id: "n-1".into(),
            sd_uuid: "u1".into(),
            title: String::new(),
            folder_id: None,
            created_at: 0,
            modified_at: 0,
            deleted: false,
        })
        .unwrap();

        idx.set_note_sd("n-1", "u2", Some("f-9")).unwrap();
        let note = idx.get_note("n-1").unwrap().unwrap();
        assert_eq!(note.sd_uuid, "u2");
        assert_eq!(note.folder_id.as_deref(), Some("f-9"));
    }

    #[test]
    fn test_move_journal_round_trip() {
        let idx = index();
        let row = MoveRow {
            id: "m-1".into(),
            note_id: "n-1".into(),
            source_sd_uuid: "u1".into(),
            target_sd_uuid: "u2".into(),
            target_folder_id: None,
            state: "initiated".into(),
            initiated_by: "inst-1".into(),
            initiated_at: 100,
            last_modified: 100,
            source_sd_path: PathBuf::from("/a"),
            target_sd_path: PathBuf::from("/b"),
            error: None,
        };
        idx.insert_move(&row).unwrap();
        assert_eq!(idx.get_move("m-1").unwrap().unwrap(), row);

        idx.update_move_state("m-1", "copying", None).unwrap();
        let updated = idx.get_move("m-1").unwrap().unwrap();
        assert_eq!(updated.state, "copying");
        assert!(updated.last_modified >= row.last_modified);

        let pending = idx.list_moves_in_states(&["copying", "initiated"]).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_purge_terminal_moves() {
        let idx = index();
        let mut row = MoveRow {
            id: "m-old".into(),
            note_id: "n".into(),
            source_sd_uuid: "u1".into(),
            target_sd_uuid: "u2".into(),
            target_folder_id: None,
            state: "completed".into(),
            initiated_by: "i".into(),
            initiated_at: 0,
            last_modified: 0,
            source_sd_path: PathBuf::from("/a"),
            target_sd_path: PathBuf::from("/b"),
            error: None,
        };
        idx.insert_move(&row).unwrap();
        row.id = "m-live".into();
        row.state = "copying".into();
        idx.insert_move(&row).unwrap();

        let removed = idx
            .purge_terminal_moves(&["completed", "cancelled", "rolled_back"], 1)
            .unwrap();
        assert_eq!(removed, 1);
        assert!(idx.get_move("m-old").unwrap().is_none());
        assert!(idx.get_move("m-live").unwrap().is_some());
    }

    #[test]
    fn test_skip_store() {
        let idx = index();
        assert!(!idx.is_skipped("u1", "peer", 7));
        idx.add_skip("u1", "peer", 7, Some("n-1")).unwrap();
        assert!(idx.is_skipped("u1", "peer", 7));

        idx.remove_skips("u1", "peer", Some("n-2")).unwrap();
        assert!(idx.is_skipped("u1", "peer", 7));
        idx.remove_skips("u1", "peer", Some("n-1")).unwrap();
        assert!(!idx.is_skipped("u1", "peer", 7));
    }

    #[test]
    fn test_settings() {
        let idx = index();
        assert!(idx.get_setting("picker.dont_ask").unwrap().is_none());
        idx.set_setting("picker.dont_ask", "1").unwrap();
        assert_eq!(idx.get_setting("picker.dont_ask").unwrap().as_deref(), Some("1"));
    }
}
