//! Per-SD orchestrator.
//!
//! An `SdManager` binds the lower tiers together for one storage directory:
//! it ensures the layout and identity files, registers the SD with the
//! append-log store, owns this instance's activity/deletion loggers and the
//! sync consumers, installs watchers with polling backups, and serializes
//! sync cycles with coalescing.
//!
//! Watcher events are suppressed until the initial sync completes (startup
//! grace period); otherwise the same peer log would be processed twice at
//! boot.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::crdt::{FolderTreeDoc, NoteDoc, NoteMetadata};
use crate::error::{NotefoldError, Result};
use crate::events::{EventBus, NoteEvent};
use crate::fs::{FileEventKind, FileSystem, FileWatch, WatchGuard};
use crate::index::{LogicalIndex, NoteRecord};
use crate::polling::PollingGroup;
use crate::profile::{ProfilePresence, WriterId};
use crate::sd::layout::SdLayout;
use crate::store::{AppendLogStore, LogTarget};
use crate::sync::{
    ActivityKind, ActivityLogger, ActivitySync, DeletionCallbacks, DeletionLogger, DeletionSync,
    StaleTracker, SyncCallbacks, SyncMetrics, WatermarkTable,
};
use crate::util::Backoff;

/// Polling backup period for the activity channel.
const ACTIVITY_POLL_PERIOD: Duration = Duration::from_secs(3);

/// Polling backup period for the deletion channel.
const DELETION_POLL_PERIOD: Duration = Duration::from_secs(10);

/// How often the in-memory watermark table is persisted.
const WATERMARK_PERSIST_PERIOD: Duration = Duration::from_secs(30);

/// Image extensions the media watcher cares about.
const MEDIA_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "heic"];

/// Shared engine pieces an SdManager is built from.
#[derive(Clone)]
pub struct SdContext {
    /// Filesystem capability.
    pub fs: Arc<dyn FileSystem>,
    /// Watch capability.
    pub watcher: Arc<dyn FileWatch>,
    /// The append-log store.
    pub store: Arc<AppendLogStore>,
    /// The logical index.
    pub index: Arc<LogicalIndex>,
    /// Event bus to external collaborators.
    pub events: EventBus,
    /// The engine-wide polling group.
    pub polling: Arc<PollingGroup>,
    /// This instance's writer identity.
    pub writer: WriterId,
    /// Metrics sink.
    pub metrics: Arc<dyn SyncMetrics>,
    /// Display name of the active profile (for presence files).
    pub profile_name: String,
    /// App version (for presence files).
    pub app_version: String,
}

/// Orchestrator for one storage directory.
pub struct SdManager {
    sd_id: String,
    layout: SdLayout,
    ctx: SdContext,
    activity_logger: Arc<ActivityLogger>,
    deletion_logger: Arc<DeletionLogger>,
    activity_sync: Arc<ActivitySync>,
    deletion_sync: Arc<DeletionSync>,
    watermarks: Arc<WatermarkTable>,
    stale: Arc<StaleTracker>,
    staged_events: Arc<Mutex<Vec<NoteEvent>>>,
    /// Stale entries already surfaced to the event bus.
    surfaced_stale: Mutex<BTreeSet<(String, u64)>>,
    /// False until the initial sync completes (startup grace period).
    ready: Arc<AtomicBool>,
    /// Serializes sync cycles: the driver loop and direct `sync_now`
    /// callers never run a cycle concurrently.
    cycle_lock: tokio::sync::Mutex<()>,
    sync_pending: Arc<AtomicBool>,
    sync_notify: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    guards: Mutex<Vec<Box<dyn WatchGuard>>>,
}

impl SdManager {
    /// Bring up one SD: register it everywhere, run the initial sync, and
    /// start the background tasks.
    ///
    /// The caller (the engine) has already resolved the SD's identity and
    /// enforced the marker policy.
    pub async fn bring_up(ctx: SdContext, sd_id: String, layout: SdLayout) -> Result<Arc<Self>> {
        layout.ensure(ctx.fs.as_ref())?;
        ctx.store.register_sd(&sd_id, layout.root());

        ProfilePresence::current(&ctx.writer, &ctx.profile_name, &ctx.app_version)
            .write_if_changed(ctx.fs.as_ref(), &layout.profiles_dir())?;

        let watermarks = Arc::new(WatermarkTable::load(ctx.index.as_ref(), &sd_id)?);
        let stale = Arc::new(StaleTracker::new());
        let staged_events: Arc<Mutex<Vec<NoteEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let activity_logger = Arc::new(ActivityLogger::new(
            ctx.fs.clone(),
            layout.activity_log(&ctx.writer.key()),
        ));
        let deletion_logger = Arc::new(DeletionLogger::new(
            ctx.fs.clone(),
            layout.deletion_log(&ctx.writer.key()),
        ));

        let deletion_callbacks = Self::deletion_callbacks(&ctx, &sd_id, &staged_events);
        let deletion_sync = Arc::new(DeletionSync::new(
            ctx.fs.clone(),
            layout.clone(),
            ctx.writer.clone(),
            watermarks.clone(),
            deletion_callbacks.clone(),
            ctx.metrics.clone(),
        ));

        let sync_callbacks =
            Self::sync_callbacks(&ctx, &sd_id, &layout, &staged_events, &deletion_callbacks);
        let activity_sync = Arc::new(ActivitySync::new(
            ctx.fs.clone(),
            layout.clone(),
            sd_id.clone(),
            ctx.writer.clone(),
            watermarks.clone(),
            stale.clone(),
            ctx.index.clone(),
            sync_callbacks,
            ctx.metrics.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            sd_id,
            layout,
            ctx,
            activity_logger,
            deletion_logger,
            activity_sync,
            deletion_sync,
            watermarks,
            stale,
            staged_events,
            surfaced_stale: Mutex::new(BTreeSet::new()),
            ready: Arc::new(AtomicBool::new(false)),
            cycle_lock: tokio::sync::Mutex::new(()),
            sync_pending: Arc::new(AtomicBool::new(false)),
            sync_notify: Arc::new(Notify::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle_notify: Arc::new(Notify::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            guards: Mutex::new(Vec::new()),
        });

        manager.cleanup_deleted_leftovers();

        // Initial sync runs before the watchers so boot doesn't process the
        // same peer log twice.
        if let Err(e) = manager.clone().run_cycle_blocking().await {
            tracing::warn!("initial sync failed (will retry on poll): {}", e);
        }
        manager.ready.store(true, Ordering::Release);

        manager.install_watchers()?;
        manager.spawn_tasks();
        Ok(manager)
    }

    /// The SD's UUID.
    pub fn sd_id(&self) -> &str {
        &self.sd_id
    }

    /// The SD's on-disk layout.
    pub fn layout(&self) -> &SdLayout {
        &self.layout
    }

    /// The stale tracker (for operator surfacing).
    pub fn stale(&self) -> &Arc<StaleTracker> {
        &self.stale
    }

    /// Skip a persistent stale gap so the watermark can advance past it.
    pub fn skip_stale_entry(&self, note_id: &str, source_writer: &str) -> Result<()> {
        self.activity_sync.skip_stale_entry(note_id, source_writer)?;
        self.request_sync();
        Ok(())
    }

    /// Undo a skip and force a recheck on the next cycle.
    pub fn retry_stale_entry(&self, note_id: &str, source_writer: &str) -> Result<()> {
        self.activity_sync.retry_stale_entry(note_id, source_writer)?;
        self.request_sync();
        Ok(())
    }

    // ==================== Local writes ====================

    /// Create a note locally. Returns the new note id.
    pub fn create_note(&self, title: &str, body: &str, folder_id: Option<&str>) -> Result<String> {
        let note_id = uuid::Uuid::new_v4().to_string();
        let doc = NoteDoc::new();
        let mut meta = NoteMetadata::new(title);
        meta.folder_id = folder_id.map(String::from);
        doc.set_metadata(&meta);
        doc.set_body(body);

        let update = doc.encode_state();
        let target = LogTarget::Note(note_id.clone());
        let seq = self.ctx.store.append_local_update(&self.sd_id, &target, &update)?;
        self.activity_logger
            .record(ActivityKind::NoteCreated, Some(&note_id), seq)?;

        self.ctx.index.upsert_note(&NoteRecord {
            note_id: note_id.clone(),
            sd_uuid: self.sd_id.clone(),
            title: meta.title.clone(),
            folder_id: meta.folder_id.clone(),
            created_at: meta.created_at,
            modified_at: meta.modified_at,
            deleted: false,
        })?;
        self.ctx.polling.mark_recent_edit(&self.sd_id, &note_id);
        Ok(note_id)
    }

    /// Replace a note's body locally.
    pub fn write_note_body(&self, note_id: &str, body: &str) -> Result<()> {
        let loaded = self.ctx.store.load_note(&self.sd_id, note_id)?;
        let Some(update) = loaded.doc.set_body(body) else {
            return Ok(());
        };
        self.append_note_update(note_id, &update, &loaded.doc)
    }

    /// Re-title a note locally.
    pub fn set_note_title(&self, note_id: &str, title: &str) -> Result<()> {
        let loaded = self.ctx.store.load_note(&self.sd_id, note_id)?;
        let Some(update) = loaded.doc.set_title(title) else {
            return Ok(());
        };
        self.append_note_update(note_id, &update, &loaded.doc)
    }

    /// Append an already-encoded local update (live editor path).
    pub fn append_note_update(&self, note_id: &str, update: &[u8], doc: &NoteDoc) -> Result<()> {
        let target = LogTarget::Note(note_id.to_string());
        let seq = self.ctx.store.append_local_update(&self.sd_id, &target, update)?;
        self.activity_logger
            .record(ActivityKind::NoteUpdate, Some(note_id), seq)?;

        let meta = doc.get_metadata();
        self.ctx.index.upsert_note(&NoteRecord {
            note_id: note_id.to_string(),
            sd_uuid: self.sd_id.clone(),
            title: meta.title,
            folder_id: meta.folder_id,
            created_at: meta.created_at,
            modified_at: meta.modified_at,
            deleted: false,
        })?;
        self.ctx.polling.mark_recent_edit(&self.sd_id, note_id);
        Ok(())
    }

    /// Mutate the folder tree locally. The closure returns the update bytes
    /// produced by the mutation (None = no-op).
    pub fn update_folders(
        &self,
        mutate: impl FnOnce(&FolderTreeDoc) -> Option<Vec<u8>>,
    ) -> Result<()> {
        let loaded = self.ctx.store.load_folders(&self.sd_id)?;
        let Some(update) = mutate(&loaded.doc) else {
            return Ok(());
        };
        let seq = self
            .ctx
            .store
            .append_local_update(&self.sd_id, &LogTarget::Folders, &update)?;
        self.activity_logger
            .record(ActivityKind::FolderUpdate, None, seq)?;
        self.ctx.events.emit(NoteEvent::FolderTreeChanged {
            sd_id: self.sd_id.clone(),
        });
        Ok(())
    }

    /// Permanently delete a note: deletion log, activity entry, local
    /// cleanup, event.
    pub fn delete_note(&self, note_id: &str) -> Result<()> {
        self.deletion_logger.record(note_id)?;
        // The activity channel also advertises the deletion so peers that
        // poll only activity converge quickly.
        self.activity_logger
            .record(ActivityKind::NoteDeleted, Some(note_id), 0)?;
        self.ctx.index.mark_note_deleted(note_id)?;
        if let Err(e) = self.ctx.store.delete_note_files(&self.sd_id, note_id) {
            tracing::warn!("cleanup for deleted note {} failed: {}", note_id, e);
        }
        self.stale.resolve_note(note_id);
        self.ctx.events.emit(NoteEvent::PermanentDeleted {
            note_id: note_id.to_string(),
            sd_id: self.sd_id.clone(),
        });
        Ok(())
    }

    /// Store image bytes under `media/`, allocating an id. Returns the id.
    pub fn store_media(&self, bytes: &[u8], ext: &str) -> Result<String> {
        let image_id = uuid::Uuid::new_v4().to_string();
        let path = self.layout.media_file(&image_id, ext)?;
        self.ctx.fs.create_dir_all(&self.layout.media_dir())?;
        self.ctx
            .fs
            .atomic_replace(&path, bytes)
            .map_err(|source| NotefoldError::FileWrite { path, source })?;
        Ok(image_id)
    }

    /// Resolve a media file's path, validating the id (path-traversal
    /// guard). The file may not have replicated yet.
    pub fn media_path(&self, image_id: &str, ext: &str) -> Result<std::path::PathBuf> {
        self.layout.media_file(image_id, ext)
    }

    /// Rewrite this writer's activity log keeping only entries newer than
    /// `min_consumed` (the minimum sequence every peer has advanced past,
    /// as determined by the shell).
    pub fn compact_activity_log(&self, min_consumed: u64) -> Result<()> {
        self.activity_logger.compact(min_consumed)
    }

    // ==================== Sync driving ====================

    /// Ask for a sync cycle. Coalesces: a request made while a cycle runs
    /// schedules exactly one follow-up cycle.
    pub fn request_sync(&self) {
        self.sync_pending.store(true, Ordering::Release);
        self.sync_notify.notify_one();
    }

    /// Run one sync cycle right now (blocking work on a blocking thread).
    /// Used for the initial sync and by tests.
    pub async fn sync_now(self: &Arc<Self>) -> Result<BTreeSet<String>> {
        self.clone().run_cycle_blocking().await
    }

    async fn run_cycle_blocking(self: Arc<Self>) -> Result<BTreeSet<String>> {
        let _serialized = self.cycle_lock.lock().await;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let manager = self.clone();
        let result = tokio::task::spawn_blocking(move || manager.run_cycle())
            .await
            .unwrap_or_else(|e| {
                Err(NotefoldError::Io(std::io::Error::other(format!(
                    "sync task panicked: {e}"
                ))))
            });
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.idle_notify.notify_waiters();
        result
    }

    /// One full cycle: activity sync, deletion sync, stale surfacing,
    /// watermark persistence, event broadcast.
    fn run_cycle(&self) -> Result<BTreeSet<String>> {
        let affected = self.activity_sync.sync_from_other_instances()?;
        self.deletion_sync.sync_from_other_instances()?;

        self.surface_stale_entries();
        self.watermarks
            .persist(self.ctx.index.as_ref(), &self.sd_id)?;

        // All affected notes were collected before any broadcast.
        let staged: Vec<NoteEvent> = std::mem::take(&mut *self.staged_events.lock().unwrap());
        self.ctx.events.emit_all(staged);
        Ok(affected)
    }

    /// Enqueue fast-path polls and emit events for newly detected stale
    /// gaps.
    fn surface_stale_entries(&self) {
        let mut surfaced = self.surfaced_stale.lock().unwrap();
        for entry in self.stale.entries() {
            let key = (entry.source_writer.clone(), entry.expected_seq);
            if !surfaced.insert(key) {
                continue;
            }
            if let Some(note_id) = entry.note_id.as_deref() {
                self.ctx.polling.add_fast_path(
                    &self.sd_id,
                    note_id,
                    vec![(entry.source_writer.clone(), entry.expected_seq)],
                );
            }
            self.ctx.events.emit(NoteEvent::StaleSync {
                sd_id: self.sd_id.clone(),
                entry,
            });
        }
    }

    /// Block until no sync cycle is pending or running, or the timeout
    /// elapses. The shutdown primitive. Returns whether the engine went
    /// idle.
    pub async fn wait_for_pending_syncs(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = !self.sync_pending.load(Ordering::Acquire)
                && self.in_flight.load(Ordering::Acquire) == 0;
            if idle {
                return true;
            }
            let wait = self.idle_notify.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return false;
            }
        }
    }

    /// Stop background tasks, flush the logger buffer, persist watermarks.
    pub async fn shut_down(&self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.guards.lock().unwrap().clear();
        if let Err(e) = self.activity_logger.flush() {
            tracing::warn!("activity flush at shutdown failed: {}", e);
        }
        if let Err(e) = self.watermarks.persist(self.ctx.index.as_ref(), &self.sd_id) {
            tracing::warn!("watermark persist at shutdown failed: {}", e);
        }
    }

    // ==================== Background tasks ====================

    fn spawn_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();

        // Serialized sync driver with coalescing.
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = manager.sync_notify.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                    while manager.sync_pending.swap(false, Ordering::AcqRel) {
                        if let Err(e) = manager.clone().run_cycle_blocking().await {
                            tracing::warn!("sync cycle failed: {}", e);
                        }
                    }
                    manager.idle_notify.notify_waiters();
                }
            }));
        }

        // Polling backups: watchers are unreliable, so polling continues
        // regardless of watcher success.
        for period in [ACTIVITY_POLL_PERIOD, DELETION_POLL_PERIOD] {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => manager.request_sync(),
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Activity buffer flush window.
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(crate::sync::FLUSH_WINDOW);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = manager.activity_logger.flush() {
                                tracing::warn!("activity flush failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // Periodic watermark persistence.
        {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(WATERMARK_PERSIST_PERIOD);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = manager
                                .watermarks
                                .persist(manager.ctx.index.as_ref(), &manager.sd_id)
                            {
                                tracing::warn!("watermark persist failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
    }

    fn install_watchers(self: &Arc<Self>) -> Result<()> {
        let dirs = [
            self.layout.folders_logs_dir(),
            self.layout.activity_dir(),
            self.layout.deleted_dir(),
            self.layout.media_dir(),
        ];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut guards = self.guards.lock().unwrap();
        for dir in dirs {
            match self.ctx.watcher.watch(&dir, tx.clone()) {
                Ok(guard) => guards.push(guard),
                // Polling covers for a failed watch.
                Err(e) => tracing::warn!("watch on {:?} failed: {}", dir, e),
            }
        }
        drop(guards);

        // One serialized consumer per SD; it must return quickly and only
        // nudges the sync driver.
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.lock().unwrap().push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if manager.watch_event_relevant(&event.path, event.kind) {
                            manager.request_sync();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
        Ok(())
    }

    /// Filter watcher events: only peer-written sync files matter, and
    /// nothing matters until the startup grace period has passed.
    fn watch_event_relevant(&self, path: &std::path::Path, _kind: FileEventKind) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.ends_with(".tmp") {
            return false;
        }
        if let Some(stem) = name.strip_suffix(".log") {
            // Own activity/deletion appends echo back from the OS watcher.
            return !self.ctx.writer.matches_key(stem);
        }
        if let Some((writer, _seq)) = crate::store::parse_log_name(name) {
            return !self.ctx.writer.matches_key(&writer);
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            tracing::debug!("media change observed: {:?}", path);
            return false;
        }
        false
    }

    /// Delete leftover files of notes whose logical deletion already
    /// completed (cleanup postponed from a previous run).
    fn cleanup_deleted_leftovers(&self) {
        let Ok(deleted) = self.ctx.index.list_deleted_notes(&self.sd_id) else {
            return;
        };
        for note_id in deleted {
            if self.ctx.store.note_exists(&self.sd_id, &note_id) {
                tracing::info!("removing leftover files of deleted note {}", note_id);
                if let Err(e) = self.ctx.store.delete_note_files(&self.sd_id, &note_id) {
                    tracing::warn!("leftover cleanup for {} failed: {}", note_id, e);
                }
            }
        }
    }

    // ==================== Callback construction ====================

    fn deletion_callbacks(
        ctx: &SdContext,
        sd_id: &str,
        staged: &Arc<Mutex<Vec<NoteEvent>>>,
    ) -> DeletionCallbacks {
        let index = ctx.index.clone();
        let store = ctx.store.clone();
        let sd = sd_id.to_string();

        let exists_index = index.clone();
        let exists_store = store.clone();
        let exists_sd = sd.clone();

        let remove_index = index;
        let remove_store = store;
        let remove_sd = sd.clone();

        let staged = staged.clone();

        DeletionCallbacks {
            note_exists: Arc::new(move |note_id: &str| {
                let known_live = exists_index
                    .get_note(note_id)
                    .ok()
                    .flatten()
                    .is_some_and(|n| !n.deleted);
                known_live || exists_store.note_exists(&exists_sd, note_id)
            }),
            remove_note: Arc::new(move |note_id: &str| {
                remove_index.mark_note_deleted(note_id)?;
                remove_store.delete_note_files(&remove_sd, note_id)
            }),
            on_deleted: Arc::new(move |note_id: &str| {
                staged.lock().unwrap().push(NoteEvent::PermanentDeleted {
                    note_id: note_id.to_string(),
                    sd_id: sd.clone(),
                });
            }),
        }
    }

    fn sync_callbacks(
        ctx: &SdContext,
        sd_id: &str,
        layout: &SdLayout,
        staged: &Arc<Mutex<Vec<NoteEvent>>>,
        deletion: &DeletionCallbacks,
    ) -> SyncCallbacks {
        let sd = sd_id.to_string();

        let reload = {
            let store = ctx.store.clone();
            let index = ctx.index.clone();
            let staged = staged.clone();
            let sd = sd.clone();
            Arc::new(move |note_id: &str| -> Result<()> {
                reload_note(&store, &index, &staged, &sd, note_id)
            })
        };

        let reload_folders = {
            let store = ctx.store.clone();
            let staged = staged.clone();
            let sd = sd.clone();
            Arc::new(move || -> Result<()> {
                // Loading validates the on-disk state; collaborators pull
                // the tree lazily after the event.
                store.load_folders(&sd)?;
                staged
                    .lock()
                    .unwrap()
                    .push(NoteEvent::FolderTreeChanged { sd_id: sd.clone() });
                Ok(())
            })
        };

        let process_remote_deletion = {
            let deletion = deletion.clone();
            Arc::new(move |note_id: &str| -> Result<()> {
                if (deletion.note_exists)(note_id) {
                    if let Err(e) = (deletion.remove_note)(note_id) {
                        tracing::warn!("cleanup for deleted note {} failed: {}", note_id, e);
                    }
                    (deletion.on_deleted)(note_id);
                }
                Ok(())
            })
        };

        let check_crdt_log_exists = {
            let store = ctx.store.clone();
            let sd = sd.clone();
            Arc::new(move |note_id: &str, writer: &str, seq: u64| {
                store.check_log_covered(&sd, &LogTarget::Note(note_id.to_string()), writer, seq)
            })
        };

        let check_folders_log_exists = {
            let store = ctx.store.clone();
            let sd = sd.clone();
            Arc::new(move |writer: &str, seq: u64| {
                store.check_log_covered(&sd, &LogTarget::Folders, writer, seq)
            })
        };

        let highest_crdt_seq = {
            let fs = ctx.fs.clone();
            let layout = layout.clone();
            Arc::new(move |note_id: Option<&str>, writer: &str| {
                let dir = match note_id {
                    Some(note_id) => layout.note_logs_dir(note_id),
                    None => layout.folders_logs_dir(),
                };
                crate::store::max_seq_for_writer(fs.as_ref(), &dir, writer)
            })
        };

        let get_loaded_notes = {
            let index = ctx.index.clone();
            let sd = sd.clone();
            Arc::new(move || {
                index
                    .list_notes(&sd)
                    .map(|notes| notes.into_iter().map(|n| n.note_id).collect())
                    .unwrap_or_default()
            })
        };

        let check_note_exists = {
            let index = ctx.index.clone();
            let store = ctx.store.clone();
            let sd = sd.clone();
            Arc::new(move |note_id: &str| {
                index.get_note(note_id).ok().flatten().is_some()
                    || store.note_exists(&sd, note_id)
            })
        };

        SyncCallbacks {
            reload_note: reload,
            reload_folders,
            process_remote_deletion,
            check_crdt_log_exists,
            check_folders_log_exists,
            highest_crdt_seq,
            get_loaded_notes,
            check_note_exists,
        }
    }
}

/// The reload contract (§ sync): load the note, treat empty content as an
/// incomplete file (retry with backoff), update the index cache, and stage
/// created/updated/moved events.
fn reload_note(
    store: &Arc<AppendLogStore>,
    index: &Arc<LogicalIndex>,
    staged: &Arc<Mutex<Vec<NoteEvent>>>,
    sd_id: &str,
    note_id: &str,
) -> Result<()> {
    let previous = index.get_note(note_id)?;
    if previous.as_ref().is_some_and(|n| n.deleted) {
        // Deletion is terminal within a run; late updates don't resurrect.
        tracing::debug!("ignoring update for deleted note {}", note_id);
        return Ok(());
    }

    let backoff = Backoff::reload();
    let attempts = backoff.max_attempts;
    let loaded = backoff
        .retry(|| {
            let loaded = store.load_note(sd_id, note_id)?;
            if loaded.doc.is_empty() {
                // Cloud sync may still be materializing the files.
                return Err(NotefoldError::FileRead {
                    path: std::path::PathBuf::from(note_id),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "note content incomplete",
                    ),
                });
            }
            Ok(loaded)
        })
        .map_err(|_| NotefoldError::Timeout {
            operation: format!("reload note {note_id}"),
            attempts,
        })?;

    if loaded.recovered_from_logs {
        tracing::warn!("note {} rebuilt from logs after corrupt snapshot", note_id);
    }

    let meta = loaded.doc.get_metadata();
    index.upsert_note(&NoteRecord {
        note_id: note_id.to_string(),
        sd_uuid: sd_id.to_string(),
        title: meta.title.clone(),
        folder_id: meta.folder_id.clone(),
        created_at: meta.created_at,
        modified_at: meta.modified_at,
        deleted: false,
    })?;

    let mut staged = staged.lock().unwrap();
    match previous {
        None => staged.push(NoteEvent::Created {
            note_id: note_id.to_string(),
            sd_id: sd_id.to_string(),
            title: meta.title,
        }),
        Some(previous) => {
            if previous.folder_id != meta.folder_id {
                staged.push(NoteEvent::Moved {
                    note_id: note_id.to_string(),
                    sd_id: sd_id.to_string(),
                    old_folder: previous.folder_id.clone(),
                    new_folder: meta.folder_id.clone(),
                });
            }
            staged.push(NoteEvent::Updated {
                note_id: note_id.to_string(),
                sd_id: sd_id.to_string(),
                state: loaded.doc.encode_state(),
            });
        }
    }
    Ok(())
}
