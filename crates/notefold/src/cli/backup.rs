//! Backup commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Subcommand;

use notefold_core::{Engine, Result};

/// `notefold backup <...>`
#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    /// Take a full manual backup of an SD
    Create {
        /// SD UUID to back up
        sd: String,
        /// Optional description stored in the metadata
        #[arg(long)]
        description: Option<String>,
    },
    /// List all backups
    List,
    /// Restore a backup into an empty directory
    Restore {
        /// Backup id (from `backup list`)
        backup_id: String,
        /// Directory to restore into (must be empty)
        target: PathBuf,
        /// Register under a fresh UUID and "(Restored)" name
        #[arg(long)]
        as_new: bool,
    },
    /// Remove pre-operation backups older than the retention window
    Cleanup,
}

pub async fn run(engine: &Arc<Engine>, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Create { sd, description } => {
            let metadata = engine.backup_sd(&sd, description.as_deref())?;
            println!(
                "backup {} ({} notes, {} bytes)",
                metadata.backup_id, metadata.note_count, metadata.size_bytes
            );
        }
        BackupCommand::List => {
            for backup in engine.backup().list_backups() {
                println!(
                    "{}  {}  {}  {}  {} note(s)",
                    backup.backup_id,
                    backup.backup_type,
                    chrono::DateTime::from_timestamp_millis(backup.timestamp)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                    backup.sd_name,
                    backup.note_count
                );
            }
        }
        BackupCommand::Restore {
            backup_id,
            target,
            as_new,
        } => {
            let restored = engine.restore_backup(&backup_id, &target, as_new).await?;
            println!(
                "restored '{}' ({}) at {}",
                restored.sd_name,
                restored.sd_uuid,
                restored.path.display()
            );
        }
        BackupCommand::Cleanup => {
            let removed = engine.backup().cleanup_old_pre_operation();
            println!("removed {removed} old pre-operation backup(s)");
        }
    }
    Ok(())
}
