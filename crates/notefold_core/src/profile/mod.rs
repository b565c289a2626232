//! Writer identity and profile presence.
//!
//! Every file this process writes into a storage directory is stamped with
//! the writer identity `(profile_id, instance_id)`. The profile id is stable
//! per user-profile on a machine; the instance id is allocated once per
//! installed app instance and persisted. Peers learn who is writing into an
//! SD from the presence files under `profiles/`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;

/// Characters allowed in profile and instance ids. The `_` separator and
/// path characters are reserved by the on-disk file name formats.
fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// The `(profile_id, instance_id)` pair that stamps all files this process
/// writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterId {
    /// Stable per user-profile on a machine
    pub profile_id: String,
    /// Stable per installed app instance
    pub instance_id: String,
}

impl WriterId {
    /// Create a writer identity, validating both components.
    pub fn new(profile_id: impl Into<String>, instance_id: impl Into<String>) -> Result<Self> {
        let profile_id = profile_id.into();
        let instance_id = instance_id.into();
        for value in [&profile_id, &instance_id] {
            if !is_valid_id(value) {
                return Err(NotefoldError::InvalidId {
                    value: value.clone(),
                    message: "ids may only contain ASCII alphanumerics and '-'".to_string(),
                });
            }
        }
        Ok(Self {
            profile_id,
            instance_id,
        })
    }

    /// The on-disk key for this writer: `<profileId>_<instanceId>`.
    ///
    /// Used as the stem of activity/deletion log files and the writer prefix
    /// of CRDT log files.
    pub fn key(&self) -> String {
        format!("{}_{}", self.profile_id, self.instance_id)
    }

    /// Whether a writer key parsed from a file name refers to this identity.
    ///
    /// Matches both the current `<profileId>_<instanceId>` form and the
    /// legacy `<instanceId>` form.
    pub fn matches_key(&self, key: &str) -> bool {
        match ParsedWriter::parse(key) {
            ParsedWriter {
                profile_id: Some(profile),
                instance_id,
            } => profile == self.profile_id && instance_id == self.instance_id,
            ParsedWriter {
                profile_id: None,
                instance_id,
            } => instance_id == self.instance_id,
        }
    }
}

impl std::fmt::Display for WriterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A writer identity parsed from a log file name.
///
/// Legacy logs carry only an instance id, so the profile may be unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWriter {
    /// Profile id if the file used the current naming format
    pub profile_id: Option<String>,
    /// Instance id (always present)
    pub instance_id: String,
}

impl ParsedWriter {
    /// Parse a writer key (a log file stem). Ids never contain `_`, so the
    /// first underscore separates profile from instance; a stem without one
    /// is the legacy instance-only form.
    pub fn parse(key: &str) -> Self {
        match key.split_once('_') {
            Some((profile, instance)) => Self {
                profile_id: Some(profile.to_string()),
                instance_id: instance.to_string(),
            },
            None => Self {
                profile_id: None,
                instance_id: key.to_string(),
            },
        }
    }
}

/// Load the persisted instance id, or allocate and persist a new one.
///
/// `pinned` (from the `NOTEFOLD_INSTANCE_ID` override) short-circuits both
/// the load and the persist.
pub fn load_or_create_instance_id(
    fs: &dyn FileSystem,
    path: &Path,
    pinned: Option<&str>,
) -> Result<String> {
    if let Some(pinned) = pinned {
        if !is_valid_id(pinned) {
            return Err(NotefoldError::InvalidId {
                value: pinned.to_string(),
                message: "pinned instance id failed validation".to_string(),
            });
        }
        return Ok(pinned.to_string());
    }

    if fs.exists(path) {
        let existing = fs
            .read_to_string(path)
            .map_err(|source| NotefoldError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
        let existing = existing.trim();
        if is_valid_id(existing) {
            return Ok(existing.to_string());
        }
        tracing::warn!("invalid persisted instance id, reallocating");
    }

    let fresh = uuid::Uuid::new_v4().to_string();
    fs.atomic_replace(path, format!("{fresh}\n").as_bytes())
        .map_err(|source| NotefoldError::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(fresh)
}

// ============================================================================
// Profile presence
// ============================================================================

/// The presence file each writer drops in every SD it contacts, so peers can
/// render human-readable origin info for stale-sync diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePresence {
    /// Profile id of the writer
    pub profile_id: String,
    /// Instance id of the writer
    pub instance_id: String,
    /// Display name of the profile
    pub profile_name: String,
    /// User handle as configured in the app
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// OS-level username
    pub username: String,
    /// Machine hostname
    pub hostname: String,
    /// OS platform tag
    pub platform: String,
    /// Version of the app that wrote this file
    pub app_version: String,
    /// Unix timestamp of the last rewrite (milliseconds)
    pub last_updated: i64,
}

impl ProfilePresence {
    /// Build a presence record for the current process environment.
    pub fn current(writer: &WriterId, profile_name: &str, app_version: &str) -> Self {
        Self {
            profile_id: writer.profile_id.clone(),
            instance_id: writer.instance_id.clone(),
            profile_name: profile_name.to_string(),
            user: None,
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            platform: std::env::consts::OS.to_string(),
            app_version: app_version.to_string(),
            last_updated: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether a rewrite is needed given what's already on disk.
    ///
    /// Compares every identity field except `last_updated`.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.profile_id != other.profile_id
            || self.instance_id != other.instance_id
            || self.profile_name != other.profile_name
            || self.user != other.user
            || self.username != other.username
            || self.hostname != other.hostname
            || self.platform != other.platform
            || self.app_version != other.app_version
    }

    /// Write this presence into an SD's `profiles/` directory if absent or
    /// changed. Returns whether a write happened.
    pub fn write_if_changed(&self, fs: &dyn FileSystem, profiles_dir: &Path) -> Result<bool> {
        fs.create_dir_all(profiles_dir)?;
        let path = profiles_dir.join(format!("{}.json", self.profile_id));

        if fs.exists(&path)
            && let Ok(raw) = fs.read_to_string(&path)
            && let Ok(existing) = serde_json::from_str::<ProfilePresence>(&raw)
            && !self.differs_from(&existing)
        {
            return Ok(false);
        }

        let json = serde_json::to_string_pretty(self)?;
        fs.atomic_replace(&path, json.as_bytes())
            .map_err(|source| NotefoldError::FileWrite {
                path: path.clone(),
                source,
            })?;
        Ok(true)
    }

    /// Read every presence file in an SD's `profiles/` directory.
    ///
    /// Unreadable entries are logged and skipped.
    pub fn read_all(fs: &dyn FileSystem, profiles_dir: &Path) -> Vec<ProfilePresence> {
        let Ok(entries) = fs.list_dir(profiles_dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for path in entries {
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match fs
                .read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(presence) => out.push(presence),
                Err(e) => tracing::warn!("skipping unreadable profile file {:?}: {}", path, e),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use std::path::PathBuf;

    fn writer() -> WriterId {
        WriterId::new("prof-1", "inst-1").unwrap()
    }

    #[test]
    fn test_writer_key_format() {
        assert_eq!(writer().key(), "prof-1_inst-1");
    }

    #[test]
    fn test_writer_id_rejects_reserved_chars() {
        assert!(WriterId::new("has_underscore", "i").is_err());
        assert!(WriterId::new("p", "has/slash").is_err());
        assert!(WriterId::new("", "i").is_err());
    }

    #[test]
    fn test_matches_key_both_formats() {
        let id = writer();
        assert!(id.matches_key("prof-1_inst-1"));
        assert!(id.matches_key("inst-1")); // legacy instance-only form
        assert!(!id.matches_key("prof-2_inst-1"));
        assert!(!id.matches_key("inst-2"));
    }

    #[test]
    fn test_parsed_writer_legacy() {
        let parsed = ParsedWriter::parse("inst-only");
        assert_eq!(parsed.profile_id, None);
        assert_eq!(parsed.instance_id, "inst-only");
    }

    #[test]
    fn test_instance_id_persisted_once() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/data/instance_id");

        let first = load_or_create_instance_id(&fs, &path, None).unwrap();
        let second = load_or_create_instance_id(&fs, &path, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_instance_id_pinned_override() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/data/instance_id");
        let id = load_or_create_instance_id(&fs, &path, Some("pinned-id")).unwrap();
        assert_eq!(id, "pinned-id");
        // Pinned ids are not persisted
        assert!(!fs.exists(&path));
    }

    #[test]
    fn test_presence_write_if_changed() {
        let fs = InMemoryFileSystem::new();
        let dir = PathBuf::from("/sd/profiles");
        let presence = ProfilePresence::current(&writer(), "Work", "0.4.0");

        assert!(presence.write_if_changed(&fs, &dir).unwrap());
        // Identical content: no rewrite
        assert!(!presence.write_if_changed(&fs, &dir).unwrap());

        // Changed field: rewrite
        let mut changed = presence.clone();
        changed.profile_name = "Home".to_string();
        assert!(changed.write_if_changed(&fs, &dir).unwrap());

        let all = ProfilePresence::read_all(&fs, &dir);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].profile_name, "Home");
    }
}
