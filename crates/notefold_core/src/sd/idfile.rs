//! SD identity files: `SD_ID`, legacy `.sd-id`, and `SD_VERSION`.

use uuid::Uuid;

use crate::error::{NotefoldError, Result};
use crate::fs::FileSystem;
use crate::sd::layout::SdLayout;

/// Current layout version written into `SD_VERSION` on first contact.
pub const CURRENT_SD_VERSION: i64 = 3;

/// Read the file as a UUID, treating invalid content as absent.
fn read_uuid(fs: &dyn FileSystem, path: &std::path::Path) -> Option<String> {
    let raw = fs.read_to_string(path).ok()?;
    let trimmed = raw.trim();
    match Uuid::parse_str(trimmed) {
        Ok(_) => Some(trimmed.to_string()),
        Err(_) => {
            tracing::warn!("invalid UUID in {:?}, treating as absent", path);
            None
        }
    }
}

/// Resolve an SD's identity, performing the legacy `.sd-id` migration.
///
/// Rules:
/// - Only `SD_ID` exists: use it.
/// - Only legacy `.sd-id` exists: adopt its value into `SD_ID` and
///   best-effort delete the old file.
/// - Both exist and disagree: `.sd-id` wins (it reflects what the running
///   code has been using); overwrite `SD_ID` and record a warning.
/// - Neither exists: generate a fresh UUIDv4 and write `SD_ID`.
///
/// Invalid UUID content in either file is treated as absent.
pub fn read_or_create_sd_id(fs: &dyn FileSystem, layout: &SdLayout) -> Result<String> {
    let id_path = layout.sd_id_file();
    let legacy_path = layout.legacy_sd_id_file();

    let current = read_uuid(fs, &id_path);
    let legacy = read_uuid(fs, &legacy_path);

    let chosen = match (current, legacy) {
        (Some(current), None) => current,
        (None, Some(legacy)) => {
            write_id(fs, layout, &legacy)?;
            if let Err(e) = fs.remove_file(&legacy_path) {
                tracing::warn!("failed to delete legacy .sd-id: {}", e);
            }
            legacy
        }
        (Some(current), Some(legacy)) => {
            if current != legacy {
                tracing::warn!(
                    "SD_ID ({}) disagrees with legacy .sd-id ({}); keeping the legacy value",
                    current,
                    legacy
                );
                write_id(fs, layout, &legacy)?;
            }
            if let Err(e) = fs.remove_file(&legacy_path) {
                tracing::warn!("failed to delete legacy .sd-id: {}", e);
            }
            legacy
        }
        (None, None) => {
            let fresh = Uuid::new_v4().to_string();
            write_id(fs, layout, &fresh)?;
            fresh
        }
    };

    Ok(chosen)
}

fn write_id(fs: &dyn FileSystem, layout: &SdLayout, id: &str) -> Result<()> {
    let path = layout.sd_id_file();
    fs.atomic_replace(&path, format!("{id}\n").as_bytes())
        .map_err(|source| NotefoldError::FileWrite { path, source })
}

/// Read `SD_VERSION`, writing the current version on first contact.
/// Unparseable content is overwritten with the current version.
pub fn read_or_create_version(fs: &dyn FileSystem, layout: &SdLayout) -> Result<i64> {
    let path = layout.sd_version_file();
    if fs.exists(&path)
        && let Ok(raw) = fs.read_to_string(&path)
        && let Ok(version) = raw.trim().parse::<i64>()
    {
        return Ok(version);
    }
    fs.atomic_replace(&path, format!("{CURRENT_SD_VERSION}\n").as_bytes())
        .map_err(|source| NotefoldError::FileWrite {
            path: path.clone(),
            source,
        })?;
    Ok(CURRENT_SD_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    const U1: &str = "11111111-1111-4111-8111-111111111111";
    const U2: &str = "22222222-2222-4222-8222-222222222222";

    fn setup() -> (InMemoryFileSystem, SdLayout) {
        (InMemoryFileSystem::new(), SdLayout::new("/sd"))
    }

    #[test]
    fn test_fresh_sd_gets_generated_id() {
        let (fs, layout) = setup();
        let id = read_or_create_sd_id(&fs, &layout).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        // Stable across calls.
        let again = read_or_create_sd_id(&fs, &layout).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn test_legacy_id_adopted_and_deleted() {
        let (fs, layout) = setup();
        fs.write(&layout.legacy_sd_id_file(), format!("{U1}\n").as_bytes())
            .unwrap();

        let id = read_or_create_sd_id(&fs, &layout).unwrap();
        assert_eq!(id, U1);
        assert!(fs.exists(&layout.sd_id_file()));
        assert!(!fs.exists(&layout.legacy_sd_id_file()));
    }

    #[test]
    fn test_disagreement_legacy_wins() {
        let (fs, layout) = setup();
        fs.write(&layout.sd_id_file(), U1.as_bytes()).unwrap();
        fs.write(&layout.legacy_sd_id_file(), U2.as_bytes()).unwrap();

        let id = read_or_create_sd_id(&fs, &layout).unwrap();
        assert_eq!(id, U2);
        let on_disk = fs.read_to_string(&layout.sd_id_file()).unwrap();
        assert_eq!(on_disk.trim(), U2);
    }

    #[test]
    fn test_invalid_content_treated_as_absent() {
        let (fs, layout) = setup();
        fs.write(&layout.sd_id_file(), b"not-a-uuid").unwrap();

        let id = read_or_create_sd_id(&fs, &layout).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(id, "not-a-uuid");
    }

    #[test]
    fn test_version_written_on_first_contact() {
        let (fs, layout) = setup();
        assert_eq!(read_or_create_version(&fs, &layout).unwrap(), CURRENT_SD_VERSION);

        fs.write(&layout.sd_version_file(), b"1\n").unwrap();
        assert_eq!(read_or_create_version(&fs, &layout).unwrap(), 1);
    }
}
