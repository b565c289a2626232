//! Top-level engine.
//!
//! The `Engine` owns the only three pieces of global state — the set of
//! registered storage directories, the writer identity, and the polling
//! group — together with the logical index, the append-log store, and the
//! event bus. Everything is held as owned values; there are no ambient
//! singletons.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backup::{BackupManager, BackupMetadata, RestoredSd};
use crate::config::{DataPaths, RuntimeOptions};
use crate::error::{NotefoldError, Result};
use crate::events::EventBus;
use crate::fs::{FileSystem, FileWatch};
use crate::index::{LogicalIndex, NoteRecord, SdRecord};
use crate::moves::{MoveExecutor, RecoveryReport};
use crate::polling::{PollCallbacks, PollConfig, PollingGroup};
use crate::profile::{load_or_create_instance_id, WriterId};
use crate::sd::{
    enforce_marker, read_or_create_sd_id, read_or_create_version, BuildKind, SdContext, SdLayout,
    SdManager,
};
use crate::store::AppendLogStore;
use crate::sync::{NoopMetrics, SyncMetrics};

/// Default timeout of [`Engine::wait_for_pending_syncs`].
pub const DEFAULT_SYNC_WAIT: Duration = Duration::from_secs(5);

/// Everything needed to start an engine.
pub struct EngineOptions {
    /// Resolved process-state locations.
    pub paths: DataPaths,
    /// The active profile's id.
    pub profile_id: String,
    /// The active profile's display name.
    pub profile_name: String,
    /// App version stamped into presence files.
    pub app_version: String,
    /// Build kind the marker policy enforces.
    pub build: BuildKind,
    /// Environment/flag overrides.
    pub runtime: RuntimeOptions,
    /// Polling tuning.
    pub poll_config: PollConfig,
    /// Asked before a dev build touches a prod SD. Defaults to refusing.
    pub confirm_prod_load: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    /// Metrics sink.
    pub metrics: Arc<dyn SyncMetrics>,
}

impl EngineOptions {
    /// Sensible defaults around a data directory and profile.
    pub fn new(paths: DataPaths, profile_id: impl Into<String>) -> Self {
        Self {
            paths,
            profile_id: profile_id.into(),
            profile_name: "Default".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            build: BuildKind::current(),
            runtime: RuntimeOptions::default(),
            poll_config: PollConfig::default(),
            confirm_prod_load: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// The running engine.
pub struct Engine {
    fs: Arc<dyn FileSystem>,
    watcher: Arc<dyn FileWatch>,
    options: EngineOptions,
    writer: WriterId,
    index: Arc<LogicalIndex>,
    store: Arc<AppendLogStore>,
    events: EventBus,
    polling: Arc<PollingGroup>,
    backup: BackupManager,
    moves: MoveExecutor,
    managers: Mutex<HashMap<String, Arc<SdManager>>>,
}

impl Engine {
    /// Build and start an engine from pre-constructed parts.
    ///
    /// Performs move-journal recovery and backup cleanup, then brings up
    /// every SD already registered in the index. SDs that refuse to load
    /// (marker policy, missing path) are skipped with a warning.
    pub async fn start(
        fs: Arc<dyn FileSystem>,
        watcher: Arc<dyn FileWatch>,
        index: Arc<LogicalIndex>,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        fs.create_dir_all(&options.paths.data_dir)?;

        let instance_id = load_or_create_instance_id(
            fs.as_ref(),
            &options.paths.instance_id_path,
            options.runtime.instance_id.as_deref(),
        )?;
        let writer = WriterId::new(options.profile_id.clone(), instance_id)?;
        let store = Arc::new(AppendLogStore::new(fs.clone(), writer.clone()));
        let events = EventBus::new();

        let backup = BackupManager::new(
            fs.clone(),
            index.clone(),
            options.paths.backups_root.clone(),
            options.paths.db_path.clone(),
        );
        let moves = MoveExecutor::new(
            fs.clone(),
            index.clone(),
            writer.key(),
            writer.instance_id.clone(),
        );

        let polling = Arc::new(PollingGroup::new(
            options.poll_config.clone(),
            Self::poll_callbacks(&index, &store),
        ));

        let engine = Arc::new(Self {
            fs,
            watcher,
            options,
            writer,
            index,
            store,
            events,
            polling,
            backup,
            moves,
            managers: Mutex::new(HashMap::new()),
        });

        // Crash recovery before anything starts writing.
        let report = engine.moves.recover()?;
        if !report.surfaced.is_empty() {
            tracing::warn!(
                "{} foreign move(s) need operator attention",
                report.surfaced.len()
            );
        }
        engine.backup.cleanup_old_pre_operation();

        // Wire the polling driver to the live managers.
        engine.install_poll_sync();
        let _ = engine.polling.spawn_driver();

        // Bring up every registered SD.
        for sd in engine.index.list_sds()? {
            if let Err(e) = engine.bring_up_sd(&sd).await {
                tracing::warn!("skipping SD '{}' at {:?}: {}", sd.name, sd.path, e);
            }
        }

        Ok(engine)
    }

    fn poll_callbacks(index: &Arc<LogicalIndex>, store: &Arc<AppendLogStore>) -> PollCallbacks {
        let list_index = index.clone();
        let check_store = store.clone();
        PollCallbacks {
            // Replaced by install_poll_sync once managers exist.
            sync_sd: Arc::new(|_| false),
            check_log_exists: Arc::new(move |sd, note, writer, seq| {
                check_store.check_log_covered(
                    sd,
                    &crate::store::LogTarget::Note(note.to_string()),
                    writer,
                    seq,
                )
            }),
            list_all_notes: Arc::new(move || {
                let Ok(sds) = list_index.list_sds() else {
                    return Vec::new();
                };
                let mut out = Vec::new();
                for sd in sds {
                    if let Ok(notes) = list_index.list_notes(&sd.uuid) {
                        out.extend(notes.into_iter().map(|n| (sd.uuid.clone(), n.note_id)));
                    }
                }
                out
            }),
        }
    }

    /// The polling group can't be built with a reference to the engine (it
    /// is created first), so the sync callback is patched in afterwards.
    fn install_poll_sync(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        self.polling.set_sync_callback(Arc::new(move |sd_id: &str| {
            let Some(engine) = engine.upgrade() else {
                return false;
            };
            if let Some(manager) = engine.sd_manager(sd_id) {
                manager.request_sync();
            }
            false
        }));
    }

    // ==================== Accessors ====================

    /// The event bus external collaborators subscribe to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// This instance's writer identity.
    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    /// The logical index.
    pub fn index(&self) -> &Arc<LogicalIndex> {
        &self.index
    }

    /// The append-log store.
    pub fn store(&self) -> &Arc<AppendLogStore> {
        &self.store
    }

    /// The backup manager.
    pub fn backup(&self) -> &BackupManager {
        &self.backup
    }

    /// The manager of a loaded SD.
    pub fn sd_manager(&self, sd_uuid: &str) -> Option<Arc<SdManager>> {
        self.managers.lock().unwrap().get(sd_uuid).cloned()
    }

    /// UUIDs of the currently loaded SDs.
    pub fn loaded_sds(&self) -> Vec<String> {
        self.managers.lock().unwrap().keys().cloned().collect()
    }

    // ==================== SD lifecycle ====================

    /// Register a new SD (or adopt an existing directory) and bring it up.
    pub async fn register_sd(&self, path: &Path, name: &str) -> Result<SdRecord> {
        let layout = SdLayout::new(path);
        self.fs.create_dir_all(path)?;
        // Refuse before creating anything inside a foreign-build SD.
        self.enforce_marker_policy(&layout)?;
        layout.ensure(self.fs.as_ref())?;
        let sd_uuid = read_or_create_sd_id(self.fs.as_ref(), &layout)?;
        let version = read_or_create_version(self.fs.as_ref(), &layout)?;

        // Duplicate-note detection: the same note id must not be loadable
        // through two SDs at once.
        self.store.register_sd(&sd_uuid, path);
        for note_id in self.store.list_note_ids(&sd_uuid) {
            if let Some(existing) = self.index.get_note(&note_id)?
                && existing.sd_uuid != sd_uuid
                && let Some(owner) = self.index.get_sd(&existing.sd_uuid)?
            {
                self.store.unregister_sd(&sd_uuid);
                return Err(NotefoldError::DuplicateNote {
                    note_id,
                    first_sd: owner.name,
                    second_sd: name.to_string(),
                });
            }
        }

        if let Err(e) = self.index.register_sd(&sd_uuid, name, path, version) {
            self.store.unregister_sd(&sd_uuid);
            return Err(e);
        }

        let record = SdRecord {
            uuid: sd_uuid.clone(),
            name: name.to_string(),
            path: path.to_path_buf(),
            version,
            added_at: chrono::Utc::now().timestamp_millis(),
        };
        self.bring_up_sd(&record).await?;
        Ok(record)
    }

    /// Bring up an already-registered SD.
    async fn bring_up_sd(&self, sd: &SdRecord) -> Result<()> {
        if self.managers.lock().unwrap().contains_key(&sd.uuid) {
            return Ok(());
        }
        let layout = SdLayout::new(&sd.path);
        self.enforce_marker_policy(&layout)?;

        let ctx = SdContext {
            fs: self.fs.clone(),
            watcher: self.watcher.clone(),
            store: self.store.clone(),
            index: self.index.clone(),
            events: self.events.clone(),
            polling: self.polling.clone(),
            writer: self.writer.clone(),
            metrics: self.options.metrics.clone(),
            profile_name: self.options.profile_name.clone(),
            app_version: self.options.app_version.clone(),
        };
        let manager = SdManager::bring_up(ctx, sd.uuid.clone(), layout).await?;

        // Index any notes the activity-driven sync didn't cover (our own
        // writes, or logs without activity entries).
        self.scan_notes_into_index(&sd.uuid)?;

        self.managers
            .lock()
            .unwrap()
            .insert(sd.uuid.clone(), manager);
        Ok(())
    }

    fn enforce_marker_policy(&self, layout: &SdLayout) -> Result<()> {
        let confirm = self.options.confirm_prod_load.clone();
        let confirm_fn: Box<dyn Fn() -> bool> = match confirm {
            Some(cb) => Box::new(move || cb()),
            None => Box::new(|| false),
        };
        enforce_marker(self.fs.as_ref(), layout, self.options.build, confirm_fn.as_ref())?;
        Ok(())
    }

    fn scan_notes_into_index(&self, sd_uuid: &str) -> Result<()> {
        for note_id in self.store.list_note_ids(sd_uuid) {
            if self.index.get_note(&note_id)?.is_some() {
                continue;
            }
            match self.store.load_note(sd_uuid, &note_id) {
                Ok(loaded) => {
                    let meta = loaded.doc.get_metadata();
                    self.index.upsert_note(&NoteRecord {
                        note_id,
                        sd_uuid: sd_uuid.to_string(),
                        title: meta.title,
                        folder_id: meta.folder_id,
                        created_at: meta.created_at,
                        modified_at: meta.modified_at,
                        deleted: false,
                    })?;
                }
                Err(e) => tracing::warn!("skipping unreadable note {}: {}", note_id, e),
            }
        }
        Ok(())
    }

    /// Unload an SD: stop its manager and drop its registration.
    pub async fn unload_sd(&self, sd_uuid: &str) -> Result<()> {
        let manager = self.managers.lock().unwrap().remove(sd_uuid);
        if let Some(manager) = manager {
            manager.wait_for_pending_syncs(DEFAULT_SYNC_WAIT).await;
            manager.shut_down().await;
        }
        self.store.unregister_sd(sd_uuid);
        self.index.unregister_sd(sd_uuid)
    }

    // ==================== Cross-cutting operations ====================

    /// Run one sync cycle on every loaded SD. Returns affected note ids.
    pub async fn sync_all(&self) -> Result<Vec<String>> {
        let managers: Vec<Arc<SdManager>> =
            self.managers.lock().unwrap().values().cloned().collect();
        let mut affected = Vec::new();
        for manager in managers {
            affected.extend(manager.sync_now().await?);
        }
        Ok(affected)
    }

    /// Block until every loaded SD's sync driver is idle, or the timeout
    /// elapses. Returns whether everything went idle.
    pub async fn wait_for_pending_syncs(&self, timeout: Duration) -> bool {
        let managers: Vec<Arc<SdManager>> =
            self.managers.lock().unwrap().values().cloned().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        for manager in managers {
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now());
            if !manager.wait_for_pending_syncs(remaining).await {
                return false;
            }
        }
        true
    }

    /// Move a note to another loaded SD. Takes a pre-operation backup
    /// first. Returns the journal row id.
    pub fn move_note(
        &self,
        note_id: &str,
        target_sd_uuid: &str,
        target_folder_id: Option<&str>,
    ) -> Result<String> {
        let note = self
            .index
            .get_note(note_id)?
            .filter(|n| !n.deleted)
            .ok_or_else(|| NotefoldError::InvalidId {
                value: note_id.to_string(),
                message: "unknown note".to_string(),
            })?;
        let source = self.index.get_sd(&note.sd_uuid)?.ok_or_else(|| {
            NotefoldError::InvalidId {
                value: note.sd_uuid.clone(),
                message: "source SD is not registered".to_string(),
            }
        })?;
        let target = self.index.get_sd(target_sd_uuid)?.ok_or_else(|| {
            NotefoldError::InvalidId {
                value: target_sd_uuid.to_string(),
                message: "target SD is not registered".to_string(),
            }
        })?;

        self.backup.create_pre_operation(
            &source.uuid,
            &source.name,
            &source.path,
            std::slice::from_ref(&note.note_id),
            &format!("before move to '{}'", target.name),
        )?;

        self.moves.execute_move(
            note_id,
            &source.uuid,
            &source.path,
            &target.uuid,
            &target.path,
            target_folder_id,
        )
    }

    /// Recover interrupted moves (also run automatically at startup).
    pub fn recover_moves(&self) -> Result<RecoveryReport> {
        self.moves.recover()
    }

    /// Restore a backup into `target_dir` and bring the restored SD up.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        target_dir: &Path,
        register_as_new: bool,
    ) -> Result<RestoredSd> {
        // Folder ids of every loaded SD, for collision naming.
        let mut live_folders = Vec::new();
        for sd in self.index.list_sds()? {
            if self.sd_manager(&sd.uuid).is_none() {
                continue;
            }
            if let Ok(loaded) = self.store.load_folders(&sd.uuid) {
                for folder_id in loaded.doc.folders().keys() {
                    live_folders.push((folder_id.clone(), sd.name.clone()));
                }
            }
        }

        let restored =
            self.backup
                .restore(backup_id, target_dir, register_as_new, &live_folders)?;

        // Normal SD bring-up: watchers, scan, index.
        let record = self.index.get_sd(&restored.sd_uuid)?.ok_or_else(|| {
            NotefoldError::RestoreFailed("restored SD vanished from the index".to_string())
        })?;
        self.bring_up_sd(&record).await?;
        Ok(restored)
    }

    /// Take a manual backup of a loaded SD.
    pub fn backup_sd(&self, sd_uuid: &str, description: Option<&str>) -> Result<BackupMetadata> {
        let sd = self
            .index
            .get_sd(sd_uuid)?
            .ok_or_else(|| NotefoldError::InvalidId {
                value: sd_uuid.to_string(),
                message: "unknown SD".to_string(),
            })?;
        self.backup
            .create_manual(&sd.uuid, &sd.name, &sd.path, description)
    }

    /// Graceful shutdown: drain syncs, stop tasks, flush snapshots,
    /// persist watermarks.
    pub async fn shutdown(&self) {
        if !self.wait_for_pending_syncs(DEFAULT_SYNC_WAIT).await {
            tracing::warn!("shutdown proceeding with syncs still pending");
        }
        let managers: Vec<Arc<SdManager>> =
            self.managers.lock().unwrap().drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.shut_down().await;
        }
        self.polling.stop();
        let manager_flush = self.store.flush_snapshots(None);
        if let Err(e) = manager_flush {
            tracing::warn!("snapshot flush at shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InMemoryFileSystem, ManualWatcher};

    fn options(fs: &Arc<InMemoryFileSystem>) -> EngineOptions {
        let _ = fs;
        let paths = DataPaths::resolve(
            Path::new("/data"),
            "prof",
            &RuntimeOptions::default(),
        );
        let mut options = EngineOptions::new(paths, "prof");
        options.build = BuildKind::Prod;
        options.poll_config = PollConfig {
            full_repoll_interval: Duration::ZERO,
            ..PollConfig::default()
        };
        options
    }

    async fn engine(fs: Arc<InMemoryFileSystem>) -> Arc<Engine> {
        Engine::start(
            fs.clone(),
            Arc::new(ManualWatcher::new()),
            Arc::new(LogicalIndex::in_memory().unwrap()),
            options(&fs),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_reload_sd() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let engine = engine(fs.clone()).await;

        let record = engine.register_sd(Path::new("/sd-a"), "Primary").await.unwrap();
        assert!(engine.sd_manager(&record.uuid).is_some());
        assert!(fs.exists(Path::new("/sd-a/SD_ID")));
        assert_eq!(fs.read_to_string(Path::new("/sd-a/SD_MARKER")).unwrap(), "prod");

        // Registering the same path under another name conflicts.
        let err = engine.register_sd(Path::new("/sd-a"), "Again").await.unwrap_err();
        assert!(matches!(err, NotefoldError::ConflictingSd { .. }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_prod_build_skips_dev_sd() {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.write(Path::new("/sd-dev/SD_MARKER"), b"dev").unwrap();
        let engine = engine(fs.clone()).await;

        let err = engine.register_sd(Path::new("/sd-dev"), "DevData").await.unwrap_err();
        assert!(matches!(err, NotefoldError::DevProdMismatch { .. }));
        assert!(engine.loaded_sds().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_write_and_sync_roundtrip() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let engine = engine(fs.clone()).await;
        let record = engine.register_sd(Path::new("/sd-a"), "Primary").await.unwrap();
        let manager = engine.sd_manager(&record.uuid).unwrap();

        let note_id = manager.create_note("Todo", "buy milk", None).unwrap();
        let note = engine.index().get_note(&note_id).unwrap().unwrap();
        assert_eq!(note.title, "Todo");

        manager.write_note_body(&note_id, "buy milk\nand bread").unwrap();
        let loaded = engine.store().load_note(&record.uuid, &note_id).unwrap();
        assert_eq!(loaded.doc.get_body(), "buy milk\nand bread");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_move_note_between_sds() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let engine = engine(fs.clone()).await;
        let a = engine.register_sd(Path::new("/sd-a"), "A").await.unwrap();
        let b = engine.register_sd(Path::new("/sd-b"), "B").await.unwrap();
        let manager = engine.sd_manager(&a.uuid).unwrap();

        let note_id = manager.create_note("Movable", "content", None).unwrap();
        engine.move_note(&note_id, &b.uuid, None).unwrap();

        let note = engine.index().get_note(&note_id).unwrap().unwrap();
        assert_eq!(note.sd_uuid, b.uuid);
        assert!(engine.store().note_exists(&b.uuid, &note_id));
        assert!(!engine.store().note_exists(&a.uuid, &note_id));

        // A pre-operation backup was taken.
        assert!(engine
            .backup()
            .list_backups()
            .iter()
            .any(|m| m.backup_type == "pre-operation"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_note_across_sds_rejected() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let engine = engine(fs.clone()).await;
        let a = engine.register_sd(Path::new("/sd-a"), "A").await.unwrap();
        let manager = engine.sd_manager(&a.uuid).unwrap();
        let note_id = manager.create_note("Dup", "x", None).unwrap();

        // A second SD carrying the same note id.
        fs.write(
            Path::new(&format!("/sd-b/notes/{note_id}/logs/w_1.crdtlog")),
            b"x",
        )
        .unwrap();
        let err = engine.register_sd(Path::new("/sd-b"), "B").await.unwrap_err();
        match err {
            NotefoldError::DuplicateNote { first_sd, second_sd, .. } => {
                assert_eq!(first_sd, "A");
                assert_eq!(second_sd, "B");
            }
            other => panic!("unexpected error: {other}"),
        }
        engine.shutdown().await;
    }
}
