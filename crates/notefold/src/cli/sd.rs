//! SD lifecycle commands: init, status, sync, watch, profiles.

use std::path::Path;
use std::sync::Arc;

use notefold_core::profile::ProfilePresence;
use notefold_core::{Engine, Result};

pub async fn init(engine: &Arc<Engine>, path: &Path, name: &str) -> Result<()> {
    let record = engine.register_sd(path, name).await?;
    println!("registered '{}' ({}) at {}", record.name, record.uuid, record.path.display());
    Ok(())
}

pub async fn status(engine: &Arc<Engine>) -> Result<()> {
    let sds = engine.index().list_sds()?;
    if sds.is_empty() {
        println!("no storage directories registered");
        return Ok(());
    }

    for sd in sds {
        let loaded = engine.sd_manager(&sd.uuid).is_some();
        let notes = engine.index().list_notes(&sd.uuid)?.len();
        println!(
            "{}  {}  {}  {} note(s){}",
            sd.uuid,
            sd.name,
            sd.path.display(),
            notes,
            if loaded { "" } else { "  [not loaded]" }
        );

        if let Some(manager) = engine.sd_manager(&sd.uuid) {
            let profiles =
                ProfilePresence::read_all(&notefold_core::fs::RealFileSystem, &manager.layout().profiles_dir());
            for diag in manager.stale().diagnostics(&profiles) {
                println!(
                    "  stale: note={} writer={} expected seq {} (seen {}, gap {}){}",
                    diag.entry.note_id.as_deref().unwrap_or("<folders>"),
                    diag.entry.source_writer,
                    diag.entry.expected_seq,
                    diag.entry.highest_seen,
                    diag.entry.gap,
                    diag.profile_name
                        .map(|name| format!("  from '{name}'"))
                        .unwrap_or_default()
                );
            }
        }
    }

    let pending = engine.recover_moves()?;
    for row in pending.surfaced {
        println!(
            "move {} of note {} ({} -> {}) held by '{}' in state {}",
            row.id, row.note_id, row.source_sd_uuid, row.target_sd_uuid, row.initiated_by, row.state
        );
    }
    Ok(())
}

pub async fn sync(engine: &Arc<Engine>) -> Result<()> {
    let affected = engine.sync_all().await?;
    if affected.is_empty() {
        println!("up to date");
    } else {
        println!("synced {} note(s):", affected.len());
        for note_id in affected {
            println!("  {note_id}");
        }
    }
    Ok(())
}

pub async fn watch(engine: &Arc<Engine>) -> Result<()> {
    println!(
        "watching {} storage directories (Ctrl-C to stop)",
        engine.loaded_sds().len()
    );
    let mut rx = engine.events().subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => println!("{}", serde_json::to_string(&event)?),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("event stream lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

pub fn profiles(engine: &Arc<Engine>) -> Result<()> {
    for sd in engine.index().list_sds()? {
        let Some(manager) = engine.sd_manager(&sd.uuid) else {
            continue;
        };
        println!("{} ({}):", sd.name, sd.uuid);
        let profiles = ProfilePresence::read_all(
            &notefold_core::fs::RealFileSystem,
            &manager.layout().profiles_dir(),
        );
        for presence in profiles {
            println!(
                "  {} ({}_{}) on {} [{}] v{}",
                presence.profile_name,
                presence.profile_id,
                presence.instance_id,
                presence.hostname,
                presence.platform,
                presence.app_version
            );
        }
    }
    Ok(())
}
