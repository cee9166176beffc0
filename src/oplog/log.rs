//! Operation Log
//!
//! Append-only, durable record of every applied mutation. Each entry is
//! one JSON line in `operations.log`; the full history is kept in memory
//! behind a single lock so readers never observe a partial append.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use super::entry::Operation;
use crate::clock::Timestamp;
use crate::error::{Error, Result};

struct LogState {
    /// Entries in local receipt order
    entries: Vec<Operation>,
    /// Identifiers of every logged operation
    ids: HashSet<String>,
    /// Append handle for the backing file
    file: File,
}

/// Operation log backed by a JSON-lines file
pub struct OperationLog {
    path: PathBuf,
    state: RwLock<LogState>,
}

impl OperationLog {
    /// Open or create the log at `path`, replaying existing entries
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        let mut ids = HashSet::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Operation>(&line) {
                    Ok(op) => {
                        if ids.insert(op.operation_id.clone()) {
                            entries.push(op);
                        }
                    }
                    Err(e) => {
                        warn!("Skipping corrupt operation log line {} in {:?}: {}", line_no + 1, path, e);
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Operation log {:?} loaded with {} entries", path, entries.len());

        Ok(Self {
            path,
            state: RwLock::new(LogState { entries, ids, file }),
        })
    }

    /// Append an operation. Returns `false` if its identifier was already logged.
    pub fn append(&self, op: &Operation) -> Result<bool> {
        let mut state = self.write_state()?;
        if state.ids.contains(&op.operation_id) {
            return Ok(false);
        }

        let op = op.without_payload();
        let mut line = serde_json::to_vec(&op)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.file.flush()?;

        state.ids.insert(op.operation_id.clone());
        debug!("Logged {} {} ({})", op.kind, op.filename, op.operation_id);
        state.entries.push(op);
        Ok(true)
    }

    /// Check whether an operation has been logged
    pub fn exists(&self, operation_id: &str) -> bool {
        self.read_state()
            .map(|s| s.ids.contains(operation_id))
            .unwrap_or(false)
    }

    /// Operations with a timestamp after `since`, ascending by timestamp
    pub fn since(&self, since: Timestamp) -> Vec<Operation> {
        let mut ops: Vec<Operation> = match self.read_state() {
            Ok(state) => state
                .entries
                .iter()
                .filter(|op| op.timestamp > since)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
        ops.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        ops
    }

    /// Timestamp of the most recent operation, or zero if the log is empty
    pub fn last_timestamp(&self) -> Timestamp {
        self.read_state()
            .ok()
            .and_then(|s| {
                s.entries
                    .iter()
                    .map(|op| op.timestamp)
                    .max_by(|a, b| a.total_cmp(b))
            })
            .unwrap_or(0.0)
    }

    /// Newest logged operation on `filename` that affected `node`'s copy,
    /// under the conflict ordering.
    ///
    /// Transfers between other nodes are logged here too but leave the
    /// local file alone, so they are not considered.
    pub fn latest_effective_for(&self, filename: &str, node: &str) -> Option<Operation> {
        let state = self.read_state().ok()?;
        state
            .entries
            .iter()
            .filter(|op| op.filename == filename && op.affects(node))
            .max_by(|a, b| a.precedence(b))
            .cloned()
    }

    /// All entries in local receipt order
    pub fn entries(&self) -> Vec<Operation> {
        self.read_state()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Number of logged operations
    pub fn len(&self) -> usize {
        self.read_state().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, LogState>> {
        self.state
            .read()
            .map_err(|_| Error::Internal("operation log lock poisoned".into()))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, LogState>> {
        self.state
            .write()
            .map_err(|_| Error::Internal("operation log lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_append_is_idempotent() {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();

        let op = Operation::delete("node-1", "a.txt", 10.0);
        assert!(log.append(&op).unwrap());
        assert!(!log.append(&op).unwrap());
        assert_eq!(log.len(), 1);
        assert!(log.exists(&op.operation_id));
        assert!(!log.exists("delete_a.txt_0"));
    }

    #[test]
    fn test_since_is_ordered_and_exclusive() {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();

        for ts in [5.0, 1.0, 3.0] {
            log.append(&Operation::delete("node-1", format!("f{}", ts), ts)).unwrap();
        }

        let all: Vec<f64> = log.since(0.0).iter().map(|op| op.timestamp).collect();
        assert_eq!(all, vec![1.0, 3.0, 5.0]);

        let after: Vec<f64> = log.since(3.0).iter().map(|op| op.timestamp).collect();
        assert_eq!(after, vec![5.0]);

        assert_eq!(log.last_timestamp(), 5.0);
    }

    #[test]
    fn test_empty_log_last_timestamp_is_zero() {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();
        assert_eq!(log.last_timestamp(), 0.0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_reload_from_disk_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("operations.log");
        {
            let log = OperationLog::open(&path).unwrap();
            log.append(&Operation::delete("node-1", "a", 1.0)).unwrap();
            log.append(
                &Operation::transfer("node-1", "node-2", "b", 2.0).with_payload("aGk=".into()),
            )
            .unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{not json\n").unwrap();
        }

        let log = OperationLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        let entries = log.entries();
        assert_eq!(entries[0].filename, "a");
        assert!(entries[1].file_data.is_none(), "payloads are never persisted");
    }

    #[test]
    fn test_latest_effective_for_uses_conflict_order() {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();

        log.append(&Operation::transfer("node-b", "node-a", "f", 7.0)).unwrap();
        log.append(&Operation::delete("node-a", "f", 3.0)).unwrap();
        log.append(&Operation::delete("node-c", "g", 9.0)).unwrap();

        let latest = log.latest_effective_for("f", "node-a").unwrap();
        assert_eq!(latest.timestamp, 7.0);
        assert!(log.latest_effective_for("missing", "node-a").is_none());
    }

    #[test]
    fn test_latest_effective_for_ignores_foreign_transfers() {
        let dir = tempdir().unwrap();
        let log = OperationLog::open(dir.path().join("operations.log")).unwrap();

        log.append(&Operation::delete("node-b", "f", 2.0)).unwrap();
        log.append(&Operation::transfer("node-b", "node-c", "f", 5.0)).unwrap();

        let latest = log.latest_effective_for("f", "node-a").unwrap();
        assert_eq!(latest.timestamp, 2.0);

        // Both ends of the transfer count it
        assert_eq!(log.latest_effective_for("f", "node-b").unwrap().timestamp, 5.0);
        assert_eq!(log.latest_effective_for("f", "node-c").unwrap().timestamp, 5.0);
    }

    #[test]
    fn test_concurrent_appends() {
        let dir = tempdir().unwrap();
        let log = Arc::new(OperationLog::open(dir.path().join("operations.log")).unwrap());
        let mut handles = vec![];

        for t in 0..4 {
            let log = Arc::clone(&log);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    // Every thread appends the same set of operations
                    let op = Operation::delete("node-1", format!("f{}", i), i as f64 + 1.0);
                    log.append(&op).unwrap();
                    let _ = log.since(t as f64);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 50);
    }
}
