//! Configuration types for the engine.
//!
//! Two layers: the persisted TOML [`Config`] (user preferences) and the
//! per-process [`RuntimeOptions`] gathered from environment variables and
//! CLI flags. Test overrides short-circuit the normal locations so
//! integration tests never touch the real user-data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;

/// Environment variable pinning the instance id.
pub const ENV_INSTANCE_ID: &str = "NOTEFOLD_INSTANCE_ID";

/// Environment variable overriding the user-data directory.
pub const ENV_TEST_STORAGE_DIR: &str = "NOTEFOLD_TEST_STORAGE_DIR";

/// Environment variable overriding the logical index path.
pub const ENV_TEST_DB_PATH: &str = "NOTEFOLD_TEST_DB_PATH";

/// Environment variable overriding the config file path.
pub const ENV_TEST_CONFIG_PATH: &str = "NOTEFOLD_TEST_CONFIG_PATH";

/// `Config` is the persisted part of what the user can configure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Display name of the active profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,

    /// Force the build kind the marker policy sees ("dev" or "prod").
    /// Meant for development against production data; use with care.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_override: Option<String>,

    /// Polling rate override (polls per minute)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_rate_per_minute: Option<f64>,

    /// Full-repoll interval override in seconds (0 disables the sweep)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_repoll_interval_secs: Option<u64>,
}

impl Config {
    /// Load from a TOML file, returning defaults when the file is absent.
    pub fn load_from(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        let raw = fs
            .read_to_string(path)
            .map_err(|source| NotefoldError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Save as TOML.
    pub fn save_to(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent)?;
        }
        fs.atomic_replace(path, raw.as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Per-process options from environment variables and CLI flags.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Pinned instance id (skips allocation and persistence).
    pub instance_id: Option<String>,
    /// Test override: user-data directory.
    pub storage_dir: Option<PathBuf>,
    /// Test override: logical index path.
    pub db_path: Option<PathBuf>,
    /// Test override: config file path.
    pub config_path: Option<PathBuf>,
    /// Skip session restore at startup.
    pub fresh_start: bool,
    /// Dump the profile configuration and exit.
    pub debug_profiles: bool,
    /// Clear the profile picker's "don't ask again" bit.
    pub reset_picker: bool,
    /// Select a profile by name.
    pub profile: Option<String>,
    /// Select a profile by id.
    pub profile_id: Option<String>,
    /// Use the default profile without showing the picker.
    pub skip_picker: bool,
}

impl RuntimeOptions {
    /// Read the environment-variable overrides. Flags are merged in by the
    /// CLI layer.
    pub fn from_env() -> Self {
        Self {
            instance_id: std::env::var(ENV_INSTANCE_ID).ok().filter(|v| !v.is_empty()),
            storage_dir: std::env::var(ENV_TEST_STORAGE_DIR).ok().map(PathBuf::from),
            db_path: std::env::var(ENV_TEST_DB_PATH).ok().map(PathBuf::from),
            config_path: std::env::var(ENV_TEST_CONFIG_PATH).ok().map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// Resolved filesystem locations of the process state.
#[derive(Debug, Clone)]
pub struct DataPaths {
    /// The user-data directory.
    pub data_dir: PathBuf,
    /// The logical index database for the active profile.
    pub db_path: PathBuf,
    /// The config file.
    pub config_path: PathBuf,
    /// The backup tree.
    pub backups_root: PathBuf,
    /// The persisted instance id.
    pub instance_id_path: PathBuf,
}

impl DataPaths {
    /// Resolve the layout under `base_dir`, honoring runtime overrides.
    pub fn resolve(base_dir: &Path, profile_id: &str, runtime: &RuntimeOptions) -> Self {
        let data_dir = runtime
            .storage_dir
            .clone()
            .unwrap_or_else(|| base_dir.to_path_buf());
        Self {
            db_path: runtime
                .db_path
                .clone()
                .unwrap_or_else(|| data_dir.join(format!("{profile_id}.db"))),
            config_path: runtime
                .config_path
                .clone()
                .unwrap_or_else(|| data_dir.join("config.toml")),
            backups_root: data_dir.join(".backups"),
            instance_id_path: data_dir.join("instance_id"),
            data_dir,
        }
    }
}
