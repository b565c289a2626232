//! In-memory filesystem implementation for tests.

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use super::{FileStat, FileSystem};

/// In-memory filesystem backed by a HashMap. Intended for unit tests where
/// spinning up tempdirs would be overkill or where failure injection is
/// needed.
#[derive(Default)]
pub struct InMemoryFileSystem {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, FileRecord>,
    dirs: HashSet<PathBuf>,
    clock: i64,
}

struct FileRecord {
    content: Vec<u8>,
    modified_ms: i64,
}

impl Inner {
    /// Monotonic fake clock so tests can assert ordering of mtimes.
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut cur = PathBuf::new();
        if let Some(parent) = path.parent() {
            for comp in parent.components() {
                cur.push(comp);
                self.dirs.insert(cur.clone());
            }
        }
    }
}

impl InMemoryFileSystem {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Normalize away `.` components so lookups are stable.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

impl FileSystem for InMemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&normalize(path))
            .map(|r| r.content.clone())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("not found: {:?}", path)))
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = normalize(path);
        inner.ensure_parents(&path);
        let now = inner.tick();
        inner.files.insert(
            path,
            FileRecord {
                content: content.to_vec(),
                modified_ms: now,
            },
        );
        Ok(())
    }

    fn append(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = normalize(path);
        inner.ensure_parents(&path);
        let now = inner.tick();
        let record = inner.files.entry(path).or_insert_with(|| FileRecord {
            content: Vec::new(),
            modified_ms: now,
        });
        record.content.extend_from_slice(content);
        record.modified_ms = now;
        Ok(())
    }

    fn atomic_replace(&self, path: &Path, content: &[u8]) -> Result<()> {
        // The map swap is already atomic under the lock.
        self.write(path, content)
    }

    fn create_new(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = normalize(path);
        if inner.files.contains_key(&path) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("exists: {:?}", path),
            ));
        }
        inner.ensure_parents(&path);
        let now = inner.tick();
        inner.files.insert(
            path,
            FileRecord {
                content: content.to_vec(),
                modified_ms: now,
            },
        );
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .files
            .remove(&normalize(path))
            .map(|_| ())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("not found: {:?}", path)))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let prefix = normalize(path);
        inner.files.retain(|p, _| !p.starts_with(&prefix));
        inner.dirs.retain(|p| !p.starts_with(&prefix));
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let inner = self.inner.lock().unwrap();
        let dir = normalize(dir);
        let mut entries: HashSet<PathBuf> = HashSet::new();
        for path in inner.files.keys().chain(inner.dirs.iter()) {
            if let Ok(rest) = path.strip_prefix(&dir)
                && let Some(first) = rest.components().next()
            {
                entries.insert(dir.join(first));
            }
        }
        let mut out: Vec<PathBuf> = entries.into_iter().collect();
        out.sort();
        Ok(out)
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        let path = normalize(path);
        inner.files.contains_key(&path) || inner.dirs.contains(&path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        let path = normalize(path);
        inner.dirs.contains(&path)
            || inner.files.keys().any(|p| p.starts_with(&path) && p != &path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut cur = PathBuf::new();
        for comp in normalize(path).components() {
            cur.push(comp);
            inner.dirs.insert(cur.clone());
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let from = normalize(from);
        let to = normalize(to);
        if let Some(record) = inner.files.remove(&from) {
            inner.ensure_parents(&to);
            inner.files.insert(to, record);
            return Ok(());
        }
        // Directory rename: move every file under the prefix
        if inner.dirs.contains(&from) || inner.files.keys().any(|p| p.starts_with(&from)) {
            let moved: Vec<(PathBuf, PathBuf)> = inner
                .files
                .keys()
                .filter(|p| p.starts_with(&from))
                .map(|p| (p.clone(), to.join(p.strip_prefix(&from).unwrap())))
                .collect();
            for (old, new) in moved {
                let record = inner.files.remove(&old).unwrap();
                inner.ensure_parents(&new);
                inner.files.insert(new, record);
            }
            let moved_dirs: Vec<(PathBuf, PathBuf)> = inner
                .dirs
                .iter()
                .filter(|p| p.starts_with(&from))
                .map(|p| (p.clone(), to.join(p.strip_prefix(&from).unwrap())))
                .collect();
            for (old, new) in moved_dirs {
                inner.dirs.remove(&old);
                inner.dirs.insert(new);
            }
            return Ok(());
        }
        Err(Error::new(
            ErrorKind::NotFound,
            format!("not found: {:?}", from),
        ))
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        let content = self.read(from)?;
        self.write(to, &content)
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&normalize(path))
            .map(|r| FileStat {
                len: r.content.len() as u64,
                modified_ms: r.modified_ms,
            })
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("not found: {:?}", path)))
    }
}
