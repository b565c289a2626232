//! End-to-end scenarios: two engine instances sharing one storage
//! directory on disk, as a cloud-sync service would present it once files
//! have replicated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notefold_core::config::{DataPaths, RuntimeOptions};
use notefold_core::fs::{FileSystem, ManualWatcher, RealFileSystem};
use notefold_core::index::LogicalIndex;
use notefold_core::polling::PollConfig;
use notefold_core::sd::BuildKind;
use notefold_core::{Engine, EngineOptions, NotefoldError};

/// Build an engine instance with its own data dir, profile, and pinned
/// instance id, but no full-repoll sweep (tests drive syncs explicitly).
async fn instance(base: &Path, tag: &str) -> Arc<Engine> {
    let data_dir = base.join(format!("data-{tag}"));
    let runtime = RuntimeOptions {
        instance_id: Some(format!("inst-{tag}")),
        ..RuntimeOptions::default()
    };
    let paths = DataPaths::resolve(&data_dir, &format!("prof-{tag}"), &runtime);
    let mut options = EngineOptions::new(paths, format!("prof-{tag}"));
    options.profile_name = format!("Profile {tag}");
    options.build = BuildKind::Prod;
    options.runtime = runtime;
    options.poll_config = PollConfig {
        full_repoll_interval: Duration::ZERO,
        ..PollConfig::default()
    };

    Engine::start(
        Arc::new(RealFileSystem),
        Arc::new(ManualWatcher::new()),
        Arc::new(LogicalIndex::in_memory().unwrap()),
        options,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn two_instance_convergence() {
    let dir = tempfile::tempdir().unwrap();
    let sd_path = dir.path().join("sd");

    // Instance A creates a note.
    let a = instance(dir.path(), "a").await;
    let sd_a = a.register_sd(&sd_path, "Shared").await.unwrap();
    let manager_a = a.sd_manager(&sd_a.uuid).unwrap();
    let note_id = manager_a.create_note("Greeting", "hello", None).unwrap();

    // Instance B starts later and observes A's activity log and CRDT file.
    let b = instance(dir.path(), "b").await;
    let mut events_b = b.events().subscribe();
    let sd_b = b.register_sd(&sd_path, "Shared").await.unwrap();
    assert_eq!(sd_a.uuid, sd_b.uuid, "both instances see the same SD identity");

    // B emitted note:created exactly once during bring-up.
    let event = events_b.try_recv().unwrap();
    assert_eq!(event.event_type(), "note:created");
    assert!(events_b.try_recv().is_err());

    let note_b = b.index().get_note(&note_id).unwrap().unwrap();
    assert_eq!(note_b.title, "Greeting");
    let loaded = b.store().load_note(&sd_b.uuid, &note_id).unwrap();
    assert_eq!(loaded.doc.get_body(), "hello");

    // Idempotent: nothing more to do.
    assert!(b.sync_all().await.unwrap().is_empty());

    // A edits; B converges on the next cycle. (A background poll may get
    // there first, so assert the converged state, not the affected list.)
    manager_a.write_note_body(&note_id, "hello world").unwrap();
    b.sync_all().await.unwrap();
    let loaded = b.store().load_note(&sd_b.uuid, &note_id).unwrap();
    assert_eq!(loaded.doc.get_body(), "hello world");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn stale_gap_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let sd_path = dir.path().join("sd");

    // A creates and edits the note before B ever starts, so the gap is in
    // place when B boots: its activity log advertises sequence 2 but the
    // second CRDT file is "still replicating" (hidden).
    let a = instance(dir.path(), "a").await;
    let sd = a.register_sd(&sd_path, "Shared").await.unwrap();
    let manager_a = a.sd_manager(&sd.uuid).unwrap();
    let note_id = manager_a.create_note("Laggy", "v1", None).unwrap();
    manager_a.write_note_body(&note_id, "v2").unwrap();

    let logs_dir = sd_path.join("notes").join(&note_id).join("logs");
    let hidden: PathBuf = dir.path().join("hidden.crdtlog");
    let lagging: PathBuf = RealFileSystem
        .list_dir(&logs_dir)
        .unwrap()
        .into_iter()
        .find(|p| p.file_name().unwrap().to_str().unwrap().ends_with("_2.crdtlog"))
        .expect("second log exists");
    RealFileSystem.rename(&lagging, &hidden).unwrap();

    let b = instance(dir.path(), "b").await;
    let sd_b = b.register_sd(&sd_path, "Shared").await.unwrap();
    let manager_b = b.sd_manager(&sd_b.uuid).unwrap();

    // B processed line 1, halted at line 2, and recorded the gap.
    let stale = manager_b.stale().entries();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].expected_seq, 2);
    assert_eq!(stale[0].highest_seen, 1);
    assert_eq!(stale[0].gap, 1);
    assert_eq!(b.store().load_note(&sd_b.uuid, &note_id).unwrap().doc.get_body(), "v1");

    // Re-running with unchanged on-disk state changes nothing.
    assert!(b.sync_all().await.unwrap().is_empty());
    assert_eq!(manager_b.stale().entries().len(), 1);

    // The file replicates; the next cycle converges and clears the entry.
    RealFileSystem.rename(&hidden, &lagging).unwrap();
    b.sync_all().await.unwrap();
    assert!(manager_b.stale().entries().is_empty());
    assert_eq!(b.store().load_note(&sd_b.uuid, &note_id).unwrap().doc.get_body(), "v2");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn deletion_propagates_and_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let sd_path = dir.path().join("sd");

    let a = instance(dir.path(), "a").await;
    let sd = a.register_sd(&sd_path, "Shared").await.unwrap();
    let manager_a = a.sd_manager(&sd.uuid).unwrap();
    let note_id = manager_a.create_note("Doomed", "bye", None).unwrap();

    let b = instance(dir.path(), "b").await;
    let sd_b = b.register_sd(&sd_path, "Shared").await.unwrap();
    assert!(b.index().get_note(&note_id).unwrap().is_some());

    let mut events_b = b.events().subscribe();
    manager_a.delete_note(&note_id).unwrap();
    b.sync_all().await.unwrap();

    let mut saw_deleted = false;
    while let Ok(event) = events_b.try_recv() {
        if event.event_type() == "note:permanent-deleted" {
            saw_deleted = true;
        }
    }
    assert!(saw_deleted);
    assert!(b.index().get_note(&note_id).unwrap().unwrap().deleted);
    assert!(!b.store().note_exists(&sd_b.uuid, &note_id));

    // Terminal within the run: re-syncing never resurrects it.
    b.sync_all().await.unwrap();
    assert!(b.index().get_note(&note_id).unwrap().unwrap().deleted);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn shutdown_compacts_and_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sd_path = dir.path().join("sd");

    let note_id = {
        let a = instance(dir.path(), "a").await;
        let sd = a.register_sd(&sd_path, "Shared").await.unwrap();
        let manager = a.sd_manager(&sd.uuid).unwrap();
        let note_id = manager.create_note("Durable", "first", None).unwrap();
        manager.write_note_body(&note_id, "first second").unwrap();
        a.shutdown().await;
        note_id
    };

    // Shutdown compacted the dirty note into a snapshot.
    let snapshot = sd_path.join("notes").join(&note_id).join("snapshot.yjs");
    assert!(snapshot.exists());

    // A fresh instance reconstructs the same document, and the old
    // activity entries pointing at compacted-away logs are not gaps.
    let a2 = instance(dir.path(), "a2").await;
    let sd = a2.register_sd(&sd_path, "Shared").await.unwrap();
    let loaded = a2.store().load_note(&sd.uuid, &note_id).unwrap();
    assert_eq!(loaded.doc.get_body(), "first second");
    let manager = a2.sd_manager(&sd.uuid).unwrap();
    assert!(manager.stale().entries().is_empty());
    a2.shutdown().await;
}

#[tokio::test]
async fn restore_with_duplicate_uuid_refused_then_as_new() {
    let dir = tempfile::tempdir().unwrap();
    let sd_path = dir.path().join("sd");

    let a = instance(dir.path(), "a").await;
    let sd = a.register_sd(&sd_path, "Original").await.unwrap();
    let manager = a.sd_manager(&sd.uuid).unwrap();
    manager.create_note("Backed up", "content", None).unwrap();

    let metadata = a.backup_sd(&sd.uuid, Some("full")).unwrap();

    // Same UUID still registered: refused, naming the offender.
    let target = dir.path().join("restored");
    let err = a.restore_backup(&metadata.backup_id, &target, false).await.unwrap_err();
    match err {
        NotefoldError::ConflictingSd { message, existing_name, .. } => {
            assert!(message.contains(&sd.uuid));
            assert_eq!(existing_name, "Original");
        }
        other => panic!("unexpected error: {other}"),
    }

    // But the backed-up note also still lives in the loaded SD, so even a
    // restore-as-new is refused until that SD is unloaded.
    let err = a.restore_backup(&metadata.backup_id, &target, true).await.unwrap_err();
    match err {
        NotefoldError::RestoreFailed(message) => assert!(message.contains("Original")),
        other => panic!("unexpected error: {other}"),
    }

    // After unloading, restore-as-new succeeds with a fresh identity.
    a.unload_sd(&sd.uuid).await.unwrap();
    let restored = a
        .restore_backup(&metadata.backup_id, &target, true)
        .await
        .unwrap();
    assert_ne!(restored.sd_uuid, sd.uuid);
    assert_eq!(restored.sd_name, "Original (Restored)");
    assert!(a.sd_manager(&restored.sd_uuid).is_some());

    a.shutdown().await;
}
