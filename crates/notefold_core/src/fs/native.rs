//! Native filesystem implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{Error, ErrorKind, Result, Write};
use std::path::{Path, PathBuf};

use super::{FileStat, FileSystem};

/// This is a simple filesystem implementation that maps to std::fs methods,
/// adding the fsync discipline the append-log store needs.
#[derive(Clone, Copy)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        fs::write(path, content)
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        // One write_all call: POSIX append atomicity covers our short lines.
        file.write_all(content)?;
        file.flush()
    }

    fn atomic_replace(&self, path: &Path, content: &[u8]) -> Result<()> {
        let tmp = tmp_sibling(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        match fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave no partial file behind
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn create_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        // This atomic check prevents race conditions
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(content)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                entries.push(entry.path());
            }
        }
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if !from.exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("Source not found: {:?}", from),
            ));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to).map(|_| ())
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path)?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_millis() as i64)
            })
            .unwrap_or(0);
        Ok(FileStat {
            len: meta.len(),
            modified_ms,
        })
    }

    fn sync_file(&self, path: &Path) -> Result<()> {
        File::open(path)?.sync_all()
    }
}

/// Sibling `.tmp` path used by atomic_replace. Kept next to the target so the
/// rename stays on one filesystem.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
