//! Filesystem capability module.
//!
//! This module provides the `FileSystem` trait for abstracting filesystem
//! operations with the atomic-replace semantics the append-log store relies
//! on, plus the `FileWatch` capability for directory change notification.
//!
//! Everything above this tier goes through these traits, so tests can run
//! against [`InMemoryFileSystem`] and a [`ManualWatcher`](watch::ManualWatcher)
//! without touching disk.

mod memory;
mod native;
pub mod watch;

pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;
pub use watch::{FileEvent, FileEventKind, FileWatch, ManualWatcher, NotifyWatcher, WatchGuard};

use std::io::Result;
use std::path::{Path, PathBuf};

/// File metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File length in bytes.
    pub len: u64,
    /// Last modification time, unix milliseconds. Zero when the backing
    /// store can't report one.
    pub modified_ms: i64,
}

/// Abstraction over filesystem operations.
///
/// Allows for different implementations: real filesystem, in-memory (for
/// tests), etc. Send + Sync required because sync drivers run on a
/// multi-threaded runtime.
pub trait FileSystem: Send + Sync {
    /// Reads the full file content as bytes.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Reads the file content as a UTF-8 string.
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Overwrites a file with new content, creating it if absent.
    ///
    /// Not atomic; use [`FileSystem::atomic_replace`] for files readers may
    /// observe mid-write.
    fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Appends bytes to a file, creating it if absent.
    ///
    /// Implementations must issue exactly one underlying append per call so
    /// that short writes (log lines) land atomically.
    fn append(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Replaces a file atomically: write to `<path>.tmp`, fsync, rename.
    ///
    /// After a successful return, readers see either the old content or the
    /// new content, never a partial file.
    fn atomic_replace(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Creates a file ONLY if it doesn't exist.
    /// Returns an error if the file exists. Used for advisory locks.
    fn create_new(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Deletes a file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Recursively deletes a directory and its contents.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Lists all entries in a directory (not recursive).
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Checks if a file or directory exists.
    fn exists(&self, path: &Path) -> bool;

    /// Checks if a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Renames `from` to `to`. Errors if the source does not exist.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Copies a single file, creating the destination's parent directories.
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Returns length and modification time for a path.
    fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Flushes a file's content to durable storage (fsync).
    ///
    /// No-op for backends without a durability distinction.
    fn sync_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Copy a directory tree through the capability. Returns the total bytes
/// copied.
pub fn copy_dir_recursive(fs: &dyn FileSystem, from: &Path, to: &Path) -> Result<u64> {
    fs.create_dir_all(to)?;
    let mut bytes = 0u64;
    for entry in fs.list_dir(from)? {
        let Some(name) = entry.file_name() else {
            continue;
        };
        let dest = to.join(name);
        if fs.is_dir(&entry) {
            bytes += copy_dir_recursive(fs, &entry, &dest)?;
        } else {
            fs.copy_file(&entry, &dest)?;
            bytes += fs.stat(&dest).map(|s| s.len).unwrap_or(0);
        }
    }
    Ok(bytes)
}

// Blanket implementation for references to FileSystem
impl<T: FileSystem + ?Sized> FileSystem for &T {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        (*self).read(path)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        (*self).read_to_string(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        (*self).write(path, content)
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<()> {
        (*self).append(path, content)
    }

    fn atomic_replace(&self, path: &Path, content: &[u8]) -> Result<()> {
        (*self).atomic_replace(path, content)
    }

    fn create_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        (*self).create_new(path, content)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        (*self).remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        (*self).remove_dir_all(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        (*self).list_dir(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        (*self).exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (*self).is_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        (*self).create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        (*self).rename(from, to)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        (*self).copy_file(from, to)
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        (*self).stat(path)
    }

    fn sync_file(&self, path: &Path) -> Result<()> {
        (*self).sync_file(path)
    }
}

impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.as_ref().read(path)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.as_ref().read_to_string(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.as_ref().write(path, content)
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.as_ref().append(path, content)
    }

    fn atomic_replace(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.as_ref().atomic_replace(path, content)
    }

    fn create_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.as_ref().create_new(path, content)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.as_ref().remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.as_ref().remove_dir_all(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        self.as_ref().list_dir(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        self.as_ref().exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.as_ref().is_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.as_ref().create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.as_ref().rename(from, to)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        self.as_ref().copy_file(from, to)
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        self.as_ref().stat(path)
    }

    fn sync_file(&self, path: &Path) -> Result<()> {
        self.as_ref().sync_file(path)
    }
}
