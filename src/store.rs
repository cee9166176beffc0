//! File Store
//!
//! Byte-level access to the shared directory. Writes go through a hidden
//! temp file and a rename, so a listing never sees a half-written file,
//! and writes to the same logical path are serialised.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Timestamp;
use crate::error::{Error, Result};

/// Marker embedded in in-flight temp file names
const TEMP_MARKER: &str = ".wolfsync-tmp-";

/// A file or directory in the shared directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the store root, `/`-separated
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch
    pub modified: Timestamp,
    pub is_dir: bool,
}

/// Shared-directory file store
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open the store, creating the root directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every file and directory under the root
    pub fn list(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        self.walk(&self.root, &mut entries)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<FileEntry>) -> Result<()> {
        for item in fs::read_dir(dir)? {
            let item = item?;
            let file_name = item.file_name().to_string_lossy().to_string();
            if file_name.contains(TEMP_MARKER) {
                continue;
            }

            let path = item.path();
            let meta = match item.metadata() {
                Ok(m) => m,
                // Removed between read_dir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            out.push(FileEntry {
                name: self.relative_name(&path),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified,
                is_dir: meta.is_dir(),
            });

            if meta.is_dir() {
                self.walk(&path, out)?;
            }
        }
        Ok(())
    }

    /// Read a file's bytes
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => {
                Err(Error::FileNotFound(name.to_string()))
            }
            Err(_) if path.is_dir() => Err(Error::FileNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a file or directory exists
    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Write a file, replacing any previous content
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        let lock = self.path_lock(name);
        let _guard = lock
            .lock()
            .map_err(|_| Error::Internal("file lock poisoned".into()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}{}{}", base, TEMP_MARKER, uuid::Uuid::new_v4()));

        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes)", name, data.len());
        Ok(())
    }

    /// Delete a file or directory. Returns `false` if it did not exist.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.resolve(name)?;
        let lock = self.path_lock(name);
        let _guard = lock
            .lock()
            .map_err(|_| Error::Internal("file lock poisoned".into()))?;

        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }

        debug!("Deleted {}", name);
        Ok(true)
    }

    /// Resolve a relative name to a path under the root
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidPath(name.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn relative_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn path_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store.write("docs/report.txt", b"hello").unwrap();
        assert_eq!(store.read("docs/report.txt").unwrap(), b"hello");
        assert!(store.exists("docs/report.txt"));

        assert!(store.delete("docs/report.txt").unwrap());
        assert!(!store.delete("docs/report.txt").unwrap());
        assert!(matches!(store.read("docs/report.txt"), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_list_includes_dirs_and_hides_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store.write("a.txt", b"123").unwrap();
        store.write("sub/b.txt", b"4567").unwrap();
        fs::write(dir.path().join(format!(".c.txt{}x", TEMP_MARKER)), b"partial").unwrap();

        let entries = store.list().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub", "sub/b.txt"]);

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert!(sub.is_dir);
        let b = entries.iter().find(|e| e.name == "sub/b.txt").unwrap();
        assert_eq!(b.size, 4);
        assert!(b.modified > 0.0);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        for bad in ["", "../etc/passwd", "/etc/passwd", "a/../../b"] {
            assert!(matches!(store.write(bad, b"x"), Err(Error::InvalidPath(_))), "{}", bad);
        }
    }

    #[test]
    fn test_delete_directory() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store.write("tree/leaf.txt", b"x").unwrap();
        assert!(store.delete("tree").unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writes_same_path() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let mut handles = vec![];

        for i in 0..8u8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let data = vec![i; 4096];
                store.write("shared.bin", &data).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let data = store.read("shared.bin").unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|b| *b == data[0]), "content must come from a single writer");
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
