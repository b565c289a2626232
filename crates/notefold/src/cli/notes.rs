//! Note commands: list, create, delete, move.

use std::sync::Arc;

use notefold_core::{Engine, NotefoldError, Result};

pub fn list(engine: &Arc<Engine>, sd: Option<&str>) -> Result<()> {
    let sds = match sd {
        Some(uuid) => engine
            .index()
            .get_sd(uuid)?
            .into_iter()
            .collect::<Vec<_>>(),
        None => engine.index().list_sds()?,
    };

    for sd in sds {
        let notes = engine.index().list_notes(&sd.uuid)?;
        println!("{} ({} note(s)):", sd.name, notes.len());
        for note in notes {
            let title = if note.title.is_empty() { "<untitled>" } else { note.title.as_str() };
            println!(
                "  {}  {}{}",
                note.note_id,
                title,
                note.folder_id
                    .as_deref()
                    .map(|f| format!("  [folder {f}]"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub fn create(engine: &Arc<Engine>, sd: &str, title: &str, body: &str) -> Result<()> {
    let manager = engine.sd_manager(sd).ok_or_else(|| NotefoldError::InvalidId {
        value: sd.to_string(),
        message: "not a loaded SD".to_string(),
    })?;
    let note_id = manager.create_note(title, body, None)?;
    println!("{note_id}");
    Ok(())
}

pub fn delete(engine: &Arc<Engine>, note_id: &str) -> Result<()> {
    let note = engine
        .index()
        .get_note(note_id)?
        .ok_or_else(|| NotefoldError::InvalidId {
            value: note_id.to_string(),
            message: "unknown note".to_string(),
        })?;
    let manager = engine
        .sd_manager(&note.sd_uuid)
        .ok_or_else(|| NotefoldError::InvalidId {
            value: note.sd_uuid.clone(),
            message: "the note's SD is not loaded".to_string(),
        })?;
    manager.delete_note(note_id)?;
    println!("deleted {note_id}");
    Ok(())
}

pub fn move_note(
    engine: &Arc<Engine>,
    note_id: &str,
    target_sd: &str,
    folder: Option<&str>,
) -> Result<()> {
    let move_id = engine.move_note(note_id, target_sd, folder)?;
    println!("move {move_id} completed");
    Ok(())
}
