//! Argument definitions and command dispatch.

mod backup;
mod notes;
mod sd;
mod stale;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use notefold_core::config::{Config, DataPaths, RuntimeOptions};
use notefold_core::fs::{NotifyWatcher, RealFileSystem};
use notefold_core::index::LogicalIndex;
use notefold_core::polling::PollConfig;
use notefold_core::sd::BuildKind;
use notefold_core::{Engine, EngineOptions, NotefoldError, Result};

/// Local-first note sync engine.
#[derive(Debug, Parser)]
#[command(name = "notefold", version, about)]
pub struct Cli {
    /// Override the user-data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Select a profile by name
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Select a profile by id
    #[arg(long, global = true)]
    pub profile_id: Option<String>,

    /// Use the default profile without asking
    #[arg(long, global = true)]
    pub skip_picker: bool,

    /// Skip session restore at startup
    #[arg(long, global = true)]
    pub fresh_start: bool,

    /// Dump the profile configuration and exit
    #[arg(long, global = true)]
    pub debug_profiles: bool,

    /// Clear the profile picker's "don't ask again" bit
    #[arg(long, global = true)]
    pub reset_picker: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a directory as a storage directory (creating its layout)
    Init {
        /// Path of the storage directory
        path: PathBuf,
        /// Display name for the registration
        #[arg(long)]
        name: String,
    },
    /// Show registered SDs, stale entries, and pending moves
    Status,
    /// Run one sync cycle across every loaded SD
    Sync,
    /// Keep the engine running (watchers + polling) until interrupted
    Watch,
    /// List notes
    Notes {
        /// Restrict to one SD by UUID
        #[arg(long)]
        sd: Option<String>,
    },
    /// Create a note
    Create {
        /// SD to create the note in
        #[arg(long)]
        sd: String,
        /// Note title
        #[arg(long)]
        title: String,
        /// Note body
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Permanently delete a note everywhere
    Delete {
        /// The note to delete
        note_id: String,
    },
    /// Backup operations
    #[command(subcommand)]
    Backup(backup::BackupCommand),
    /// Move a note to another storage directory
    MoveNote {
        /// The note to move
        note_id: String,
        /// Target SD UUID
        target_sd: String,
        /// Target folder id
        #[arg(long)]
        folder: Option<String>,
    },
    /// Stale-sync entry operations
    #[command(subcommand)]
    Stale(stale::StaleCommand),
    /// Show profile presence across loaded SDs
    Profile,
}

/// Resolve paths, start the engine, dispatch, shut down.
pub async fn run(cli: Cli) -> Result<()> {
    let base_dir = cli
        .data_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("notefold")))
        .ok_or(NotefoldError::NoDataDir)?;

    let mut runtime = RuntimeOptions::from_env();
    runtime.fresh_start = cli.fresh_start;
    runtime.debug_profiles = cli.debug_profiles;
    runtime.reset_picker = cli.reset_picker;
    runtime.profile = cli.profile.clone();
    runtime.profile_id = cli.profile_id.clone();
    runtime.skip_picker = cli.skip_picker;

    // The picker UI lives in the shell; the CLI resolves a profile id from
    // flags or falls back to the default profile.
    let profile_id = runtime
        .profile_id
        .clone()
        .or_else(|| runtime.profile.clone())
        .unwrap_or_else(|| "default".to_string());

    let paths = DataPaths::resolve(&base_dir, &profile_id, &runtime);
    let fs = Arc::new(RealFileSystem);
    fs_prepare(&paths)?;
    let config = Config::load_from(&RealFileSystem, &paths.config_path)?;

    if runtime.reset_picker {
        let index = LogicalIndex::open(&paths.db_path)?;
        index.set_setting("picker.dont_ask", "0")?;
    }

    let index = Arc::new(LogicalIndex::open(&paths.db_path)?);

    let mut poll_config = PollConfig::default();
    if let Some(rate) = config.poll_rate_per_minute {
        poll_config.poll_rate_per_minute = rate;
    }
    if let Some(secs) = config.full_repoll_interval_secs {
        poll_config.full_repoll_interval = std::time::Duration::from_secs(secs);
    }

    let mut options = EngineOptions::new(paths, profile_id);
    options.profile_name = config
        .profile_name
        .clone()
        .or(runtime.profile.clone())
        .unwrap_or_else(|| "Default".to_string());
    options.build = match config.build_override.as_deref() {
        Some("dev") => BuildKind::Dev,
        Some("prod") => BuildKind::Prod,
        _ => BuildKind::current(),
    };
    options.runtime = runtime.clone();
    options.poll_config = poll_config;
    // A dev build touching a prod SD asks on the terminal.
    options.confirm_prod_load = Some(Arc::new(confirm_on_terminal));

    if runtime.debug_profiles {
        println!("profile_id: {}", options.profile_id);
        println!("profile_name: {}", options.profile_name);
        println!("data_dir: {}", options.paths.data_dir.display());
        println!("db_path: {}", options.paths.db_path.display());
        return Ok(());
    }

    let engine = Engine::start(fs, Arc::new(NotifyWatcher::new()), index, options).await?;

    let result = dispatch(&engine, cli.command).await;
    engine.shutdown().await;
    result
}

fn fs_prepare(paths: &DataPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.data_dir)?;
    Ok(())
}

fn confirm_on_terminal() -> bool {
    use std::io::Write;
    eprint!("This SD is marked 'prod' but this is a dev build. Load anyway? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

async fn dispatch(engine: &Arc<Engine>, command: Command) -> Result<()> {
    match command {
        Command::Init { path, name } => sd::init(engine, &path, &name).await,
        Command::Status => sd::status(engine).await,
        Command::Sync => sd::sync(engine).await,
        Command::Watch => sd::watch(engine).await,
        Command::Notes { sd } => notes::list(engine, sd.as_deref()),
        Command::Create { sd, title, body } => notes::create(engine, &sd, &title, &body),
        Command::Delete { note_id } => notes::delete(engine, &note_id),
        Command::Backup(command) => backup::run(engine, command).await,
        Command::MoveNote {
            note_id,
            target_sd,
            folder,
        } => notes::move_note(engine, &note_id, &target_sd, folder.as_deref()),
        Command::Stale(command) => stale::run(engine, command),
        Command::Profile => sd::profiles(engine),
    }
}
