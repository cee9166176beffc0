//! Offline Queue
//!
//! Durable buffer of mutations that could not be propagated when they were
//! made, plus the per-file sync status table. Both are JSON documents in the
//! data directory and are rewritten wholesale on every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{self, Timestamp};
use crate::error::{Error, Result};
use crate::store::FileStore;

/// File name of the queue snapshot inside the data directory
pub const QUEUE_FILE_NAME: &str = "offline_queue.json";
/// File name of the status snapshot inside the data directory
pub const STATUS_FILE_NAME: &str = "sync_status.json";

/// Kind of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineKind {
    Save,
    Delete,
}

/// A mutation waiting to be propagated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineEntry {
    #[serde(rename = "type")]
    pub kind: OfflineKind,
    pub filename: String,
    pub timestamp: Timestamp,
    /// Base64 file content for saves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Per-file synchronization status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub synced: bool,
    pub last_modified: Timestamp,
    pub pending_operations: bool,
}

impl SyncStatus {
    fn pending() -> Self {
        Self {
            synced: false,
            last_modified: clock::now(),
            pending_operations: true,
        }
    }

    fn synced_now() -> Self {
        Self {
            synced: true,
            last_modified: clock::now(),
            pending_operations: false,
        }
    }
}

impl Default for SyncStatus {
    /// A file never touched offline needs no catch-up
    fn default() -> Self {
        Self {
            synced: true,
            last_modified: 0.0,
            pending_operations: false,
        }
    }
}

/// Result of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub requeued: usize,
    /// Entries dropped because a newer mutation of the file already happened
    pub discarded: usize,
}

struct QueueState {
    queue: Vec<OfflineEntry>,
    status: BTreeMap<String, SyncStatus>,
}

/// Offline mutation queue with durable snapshots
pub struct OfflineQueue {
    queue_path: PathBuf,
    status_path: PathBuf,
    store: Arc<FileStore>,
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    /// Open the queue, reloading any snapshot left in `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, store: Arc<FileStore>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let queue_path = data_dir.join(QUEUE_FILE_NAME);
        let status_path = data_dir.join(STATUS_FILE_NAME);

        let queue: Vec<OfflineEntry> = load_snapshot(&queue_path);
        let status: BTreeMap<String, SyncStatus> = load_snapshot(&status_path);
        if !queue.is_empty() {
            info!("Reloaded {} offline operations from {:?}", queue.len(), queue_path);
        }

        Ok(Self {
            queue_path,
            status_path,
            store,
            state: Mutex::new(QueueState { queue, status }),
        })
    }

    /// Queue a mutation and persist before returning
    pub fn enqueue(
        &self,
        kind: OfflineKind,
        filename: &str,
        data: Option<String>,
    ) -> Result<OfflineEntry> {
        let entry = OfflineEntry {
            kind,
            filename: filename.to_string(),
            timestamp: clock::now(),
            data,
        };

        let mut state = self.lock()?;
        state.queue.push(entry.clone());
        state.status.insert(filename.to_string(), SyncStatus::pending());
        self.persist(&state)?;

        debug!("Queued offline {:?} for {}", kind, filename);
        Ok(entry)
    }

    /// Apply every queued entry to the file store.
    ///
    /// The queue is swapped out under the lock and applied without it;
    /// entries that fail are put back at the front of the queue.
    pub fn drain(&self) -> Result<DrainReport> {
        self.drain_unless(|_| false)
    }

    /// Like [`drain`](Self::drain), but entries for which `is_stale` holds
    /// are dropped unapplied.
    pub fn drain_unless(&self, is_stale: impl Fn(&OfflineEntry) -> bool) -> Result<DrainReport> {
        let drained = {
            let mut state = self.lock()?;
            std::mem::take(&mut state.queue)
        };
        if drained.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        let mut discarded = 0;
        for entry in drained {
            if is_stale(&entry) {
                debug!("Dropping stale offline {:?} of {}", entry.kind, entry.filename);
                discarded += 1;
                applied.push(entry.filename);
                continue;
            }
            match self.apply(&entry) {
                Ok(()) => applied.push(entry.filename),
                Err(e) => {
                    warn!("Offline {:?} of {} failed, requeueing: {}", entry.kind, entry.filename, e);
                    failed.push(entry);
                }
            }
        }

        let report = DrainReport {
            applied: applied.len() - discarded,
            requeued: failed.len(),
            discarded,
        };

        let mut state = self.lock()?;
        failed.append(&mut state.queue);
        state.queue = failed;

        for filename in applied {
            let still_pending = state.queue.iter().any(|e| e.filename == filename);
            if !still_pending {
                state.status.insert(filename, SyncStatus::synced_now());
            }
        }
        self.persist(&state)?;

        info!(
            "Offline queue drained: {} applied, {} requeued, {} discarded",
            report.applied, report.requeued, report.discarded
        );
        Ok(report)
    }

    fn apply(&self, entry: &OfflineEntry) -> Result<()> {
        match entry.kind {
            OfflineKind::Save => {
                let data = entry.data.as_deref().ok_or_else(|| {
                    Error::Protocol(format!("offline save of {} has no payload", entry.filename))
                })?;
                let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
                self.store.write(&entry.filename, &bytes)
            }
            OfflineKind::Delete => {
                // Already absent counts as applied
                self.store.delete(&entry.filename).map(|_| ())
            }
        }
    }

    /// Drop queued entries of `kind` for `filename`, returning how many went.
    ///
    /// The file's status is cleared once nothing else is queued for it.
    pub fn discard(&self, kind: OfflineKind, filename: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.queue.len();
        state.queue.retain(|e| !(e.kind == kind && e.filename == filename));
        let removed = before - state.queue.len();
        if removed == 0 {
            return Ok(0);
        }

        if !state.queue.iter().any(|e| e.filename == filename) {
            state.status.insert(filename.to_string(), SyncStatus::synced_now());
        }
        self.persist(&state)?;
        debug!("Discarded {} queued {:?} of {}", removed, kind, filename);
        Ok(removed)
    }

    /// Status of one file; untracked files are reported as synced
    pub fn status(&self, filename: &str) -> SyncStatus {
        self.lock()
            .ok()
            .and_then(|s| s.status.get(filename).cloned())
            .unwrap_or_default()
    }

    /// Status of every tracked file
    pub fn all_status(&self) -> BTreeMap<String, SyncStatus> {
        self.lock().map(|s| s.status.clone()).unwrap_or_default()
    }

    /// Record that a file reached its peers by direct delivery
    pub fn mark_synced(&self, filename: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(status) = state.status.get_mut(filename) {
            status.synced = true;
            status.pending_operations = false;
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Snapshot of the queued entries
    pub fn entries(&self) -> Vec<OfflineEntry> {
        self.lock().map(|s| s.queue.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("offline queue lock poisoned".into()))
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        write_snapshot(&self.queue_path, &state.queue)?;
        write_snapshot(&self.status_path, &state.status)
    }
}

/// Load a JSON snapshot; missing or corrupt files yield the default
fn load_snapshot<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("Failed to read {:?}, starting empty: {}", path, e);
            return T::default();
        }
    };
    serde_json::from_slice(&content).unwrap_or_else(|e| {
        warn!("Corrupt snapshot {:?}, starting empty: {}", path, e);
        T::default()
    })
}

fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn encode(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn open(dir: &Path) -> OfflineQueue {
        let store = Arc::new(FileStore::new(dir.join("shared")).unwrap());
        OfflineQueue::open(dir.join("data"), store).unwrap()
    }

    #[test]
    fn test_enqueue_marks_pending() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Save, "report.txt", Some(encode(b"v1"))).unwrap();

        let status = queue.status("report.txt");
        assert!(!status.synced);
        assert!(status.pending_operations);
        assert_eq!(queue.len(), 1);
        assert!(dir.path().join("data").join(QUEUE_FILE_NAME).exists());
        assert!(dir.path().join("data").join(STATUS_FILE_NAME).exists());
    }

    #[test]
    fn test_untracked_file_is_synced() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());
        assert_eq!(queue.status("never-touched"), SyncStatus::default());
        assert!(queue.status("never-touched").synced);
    }

    #[test]
    fn test_restart_then_drain_applies_once() {
        let dir = tempdir().unwrap();
        {
            let queue = open(dir.path());
            queue.enqueue(OfflineKind::Save, "report.txt", Some(encode(b"offline"))).unwrap();
        }

        let queue = open(dir.path());
        assert_eq!(queue.len(), 1);

        let report = queue.drain().unwrap();
        assert_eq!(report, DrainReport { applied: 1, requeued: 0, discarded: 0 });
        assert!(queue.is_empty());
        assert!(queue.status("report.txt").synced);

        let store = FileStore::new(dir.path().join("shared")).unwrap();
        assert_eq!(store.read("report.txt").unwrap(), b"offline");

        // A second drain has nothing left to apply
        assert_eq!(queue.drain().unwrap(), DrainReport::default());

        // The rewritten snapshot survives another restart
        drop(queue);
        let queue = open(dir.path());
        assert!(queue.is_empty());
        assert!(queue.status("report.txt").synced);
    }

    #[test]
    fn test_failed_entries_are_requeued() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Save, "broken.txt", Some("%%not base64%%".into())).unwrap();
        queue.enqueue(OfflineKind::Save, "good.txt", Some(encode(b"ok"))).unwrap();

        let report = queue.drain().unwrap();
        assert_eq!(report, DrainReport { applied: 1, requeued: 1, discarded: 0 });

        let remaining = queue.entries();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].filename, "broken.txt");
        assert!(!queue.status("broken.txt").synced);
        assert!(queue.status("good.txt").synced);
    }

    #[test]
    fn test_stale_entries_are_dropped_unapplied() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Save, "old.txt", Some(encode(b"stale"))).unwrap();
        queue.enqueue(OfflineKind::Save, "new.txt", Some(encode(b"fresh"))).unwrap();

        let report = queue.drain_unless(|e| e.filename == "old.txt").unwrap();
        assert_eq!(report, DrainReport { applied: 1, requeued: 0, discarded: 1 });
        assert!(queue.is_empty());
        assert!(queue.status("old.txt").synced);

        let store = FileStore::new(dir.path().join("shared")).unwrap();
        assert!(!store.exists("old.txt"));
        assert_eq!(store.read("new.txt").unwrap(), b"fresh");
    }

    #[test]
    fn test_discard_pending_saves() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Save, "a.txt", Some(encode(b"a"))).unwrap();
        queue.enqueue(OfflineKind::Save, "b.txt", Some(encode(b"b"))).unwrap();

        assert_eq!(queue.discard(OfflineKind::Save, "a.txt").unwrap(), 1);
        assert_eq!(queue.discard(OfflineKind::Delete, "b.txt").unwrap(), 0);
        assert_eq!(queue.len(), 1);
        assert!(queue.status("a.txt").synced);
        assert!(!queue.status("b.txt").synced);

        // Survives a restart
        drop(queue);
        let queue = open(dir.path());
        assert_eq!(queue.entries()[0].filename, "b.txt");
    }

    #[test]
    fn test_delete_of_absent_file_succeeds() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Delete, "gone.txt", None).unwrap();
        let report = queue.drain().unwrap();
        assert_eq!(report.applied, 1);
        assert!(queue.status("gone.txt").synced);
    }

    #[test]
    fn test_corrupt_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join(QUEUE_FILE_NAME), b"[{broken").unwrap();
        std::fs::write(data_dir.join(STATUS_FILE_NAME), b"not json").unwrap();

        let queue = open(dir.path());
        assert!(queue.is_empty());
        assert!(queue.all_status().is_empty());
    }

    #[test]
    fn test_mark_synced() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path());

        queue.enqueue(OfflineKind::Save, "a.txt", Some(encode(b"a"))).unwrap();
        queue.mark_synced("a.txt").unwrap();
        let status = queue.status("a.txt");
        assert!(status.synced);
        assert!(!status.pending_operations);

        // Untracked names are left alone
        queue.mark_synced("other.txt").unwrap();
        assert!(!queue.all_status().contains_key("other.txt"));
    }
}
