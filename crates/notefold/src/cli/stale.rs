//! Stale-sync entry commands.

use std::sync::Arc;

use clap::Subcommand;

use notefold_core::{Engine, NotefoldError, Result};

/// `notefold stale <...>`
#[derive(Debug, Subcommand)]
pub enum StaleCommand {
    /// List stale entries across loaded SDs
    List,
    /// Skip a stale entry so the watermark can advance past it
    Skip {
        /// SD UUID the entry belongs to
        #[arg(long)]
        sd: String,
        /// The affected note
        note_id: String,
        /// Writer key of the peer whose log is missing
        writer: String,
    },
    /// Clear a skip and force a recheck
    Retry {
        /// SD UUID the entry belongs to
        #[arg(long)]
        sd: String,
        /// The affected note
        note_id: String,
        /// Writer key of the peer
        writer: String,
    },
}

pub fn run(engine: &Arc<Engine>, command: StaleCommand) -> Result<()> {
    match command {
        StaleCommand::List => {
            let mut any = false;
            for sd_uuid in engine.loaded_sds() {
                let Some(manager) = engine.sd_manager(&sd_uuid) else {
                    continue;
                };
                for entry in manager.stale().entries() {
                    any = true;
                    println!(
                        "{}  note={}  writer={}  expected={}  seen={}  gap={}",
                        sd_uuid,
                        entry.note_id.as_deref().unwrap_or("<folders>"),
                        entry.source_writer,
                        entry.expected_seq,
                        entry.highest_seen,
                        entry.gap
                    );
                }
            }
            if !any {
                println!("no stale entries");
            }
        }
        StaleCommand::Skip { sd, note_id, writer } => {
            manager_for(engine, &sd)?.skip_stale_entry(&note_id, &writer)?;
            println!("skipped; watermark will advance next cycle");
        }
        StaleCommand::Retry { sd, note_id, writer } => {
            manager_for(engine, &sd)?.retry_stale_entry(&note_id, &writer)?;
            println!("skip cleared; entry will be rechecked");
        }
    }
    Ok(())
}

fn manager_for(
    engine: &Arc<Engine>,
    sd: &str,
) -> Result<Arc<notefold_core::sd::SdManager>> {
    engine.sd_manager(sd).ok_or_else(|| NotefoldError::InvalidId {
        value: sd.to_string(),
        message: "not a loaded SD".to_string(),
    })
}
