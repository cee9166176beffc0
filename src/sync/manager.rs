//! Sync Manager
//!
//! Pulls operations each reachable peer has logged since the last pass and
//! applies them in timestamp order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, info, warn};

use crate::clock::Timestamp;
use crate::error::{Error, Result};
use crate::network::{MessageSender, Request};
use crate::oplog::{Operation, OperationKind, OperationLog};
use crate::store::FileStore;

/// Sync pass state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
}

/// What `apply_operation` did with an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied to the file store and logged
    Applied,
    /// Already in the log, nothing done
    AlreadyApplied,
    /// Older than the newest logged operation on the file; logged only
    Superseded,
    /// Transfer addressed to another node; logged only
    Recorded,
    /// Content could not be fetched; not logged so a later pass retries
    Deferred,
}

/// Summary of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Peers asked for operations
    pub peers: usize,
    /// Operations received across all peers
    pub received: usize,
    /// Operations newly logged
    pub applied: usize,
    /// Operations already present locally
    pub skipped: usize,
    /// Operations left for a later pass
    pub deferred: usize,
}

/// Resets the syncing flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Anti-entropy sync manager
pub struct SyncManager {
    node_name: String,
    store: Arc<FileStore>,
    oplog: Arc<OperationLog>,
    network: OnceLock<Weak<dyn MessageSender>>,
    syncing: AtomicBool,
    /// Per-peer timestamp up to which every operation has been taken in
    watermarks: Mutex<HashMap<String, Timestamp>>,
    /// Serialises the check-apply-log step so racing deliveries of one
    /// operation touch the store once
    apply_lock: Mutex<()>,
}

impl SyncManager {
    pub fn new(node_name: impl Into<String>, store: Arc<FileStore>, oplog: Arc<OperationLog>) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            oplog,
            network: OnceLock::new(),
            syncing: AtomicBool::new(false),
            watermarks: Mutex::new(HashMap::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Bind the messaging layer. Only the first binding takes effect.
    pub fn bind_network(&self, network: Weak<dyn MessageSender>) -> Result<()> {
        self.network
            .set(network)
            .map_err(|_| Error::Internal("sync manager already bound to a network".into()))
    }

    fn network(&self) -> Option<Arc<dyn MessageSender>> {
        self.network.get().and_then(Weak::upgrade)
    }

    pub fn state(&self) -> SyncState {
        if self.syncing.load(Ordering::SeqCst) {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    /// Run one anti-entropy pass against every reachable peer.
    ///
    /// Returns `None` if a pass is already running or no network is bound.
    pub fn start_sync(&self) -> Option<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync pass already running, skipping");
            return None;
        }
        let _guard = PassGuard(&self.syncing);

        let Some(network) = self.network() else {
            warn!("Sync requested before the network was bound");
            return None;
        };

        let local_last = self.oplog.last_timestamp();
        let mut report = SyncReport::default();

        for (peer, alive) in network.peer_status() {
            if peer == self.node_name || !alive {
                continue;
            }
            report.peers += 1;
            self.sync_with_peer(network.as_ref(), &peer, local_last, &mut report);
        }

        if report.received > 0 || report.deferred > 0 {
            info!(
                "Sync pass: {} peer(s), {} received, {} applied, {} skipped, {} deferred",
                report.peers, report.received, report.applied, report.skipped, report.deferred
            );
        } else {
            debug!("Sync pass: {} peer(s), nothing new", report.peers);
        }
        Some(report)
    }

    fn sync_with_peer(
        &self,
        network: &dyn MessageSender,
        peer: &str,
        local_last: Timestamp,
        report: &mut SyncReport,
    ) {
        let since = self.watermark(peer).min(local_last);
        let request = Request::SyncRequest {
            source_node: self.node_name.clone(),
            last_timestamp: since,
        };

        let mut operations = match network.send(peer, &request) {
            Ok(response) if response.is_ok() => match response.operations {
                Some(ops) => ops,
                None => {
                    warn!("Sync response from {} carried no operations", peer);
                    return;
                }
            },
            Ok(response) => {
                warn!("Sync request rejected by {}: {}", peer, response.error_message());
                return;
            }
            Err(e) => {
                debug!("Sync with {} failed: {}", peer, e);
                return;
            }
        };

        operations.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        report.received += operations.len();

        let mut watermark = since;
        let mut blocked = false;
        for op in operations {
            let timestamp = op.timestamp;
            if self.oplog.exists(&op.operation_id) {
                report.skipped += 1;
            } else {
                match self.apply_operation(op) {
                    Ok(ApplyOutcome::Deferred) => {
                        report.deferred += 1;
                        blocked = true;
                    }
                    Ok(ApplyOutcome::AlreadyApplied) => report.skipped += 1,
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        warn!("Replay of operation from {} failed: {}", peer, e);
                        report.deferred += 1;
                        blocked = true;
                    }
                }
            }

            if !blocked {
                watermark = watermark.max(timestamp);
            }
        }

        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.to_string(), watermark);
    }

    /// Timestamp up to which `peer` has been fully taken in
    pub fn watermark(&self, peer: &str) -> Timestamp {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .copied()
            .unwrap_or(0.0)
    }

    /// Apply one operation and log it.
    ///
    /// Idempotent by operation id. Content fetches happen outside the apply
    /// lock.
    pub fn apply_operation(&self, op: Operation) -> Result<ApplyOutcome> {
        if self.oplog.exists(&op.operation_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        match op.kind {
            OperationKind::Delete => {
                let _lock = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
                if self.oplog.exists(&op.operation_id) {
                    return Ok(ApplyOutcome::AlreadyApplied);
                }
                if self.is_superseded(&op) {
                    return self.record(&op, ApplyOutcome::Superseded);
                }

                if !self.store.delete(&op.filename)? {
                    debug!("Delete of {} found nothing to remove", op.filename);
                }
                self.record(&op, ApplyOutcome::Applied)
            }

            OperationKind::Transfer => {
                if op.target_node.as_deref() != Some(self.node_name.as_str()) {
                    return self.record(&op, ApplyOutcome::Recorded);
                }
                if self.is_superseded(&op) {
                    return self.record(&op, ApplyOutcome::Superseded);
                }

                let bytes = match &op.file_data {
                    Some(data) => BASE64.decode(data)?,
                    None => match self.fetch(&op) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(
                                "Deferring {}: content unavailable from {}: {}",
                                op.operation_id, op.source_node, e
                            );
                            return Ok(ApplyOutcome::Deferred);
                        }
                    },
                };

                let _lock = self.apply_lock.lock().unwrap_or_else(|e| e.into_inner());
                if self.oplog.exists(&op.operation_id) {
                    return Ok(ApplyOutcome::AlreadyApplied);
                }
                if self.is_superseded(&op) {
                    return self.record(&op, ApplyOutcome::Superseded);
                }

                self.store.write(&op.filename, &bytes)?;
                info!("Received {} from {}", op.filename, op.source_node);
                self.record(&op, ApplyOutcome::Applied)
            }
        }
    }

    fn record(&self, op: &Operation, outcome: ApplyOutcome) -> Result<ApplyOutcome> {
        if self.oplog.append(op)? {
            debug!("Logged {} ({:?})", op.operation_id, outcome);
            Ok(outcome)
        } else {
            Ok(ApplyOutcome::AlreadyApplied)
        }
    }

    /// Check whether a newer operation that touched this node's copy of
    /// the file is already logged
    fn is_superseded(&self, op: &Operation) -> bool {
        self.oplog
            .latest_effective_for(&op.filename, &self.node_name)
            .map(|latest| latest.precedence(op) == CmpOrdering::Greater)
            .unwrap_or(false)
    }

    /// Fetch transfer content from the operation's source
    fn fetch(&self, op: &Operation) -> Result<Vec<u8>> {
        if op.source_node == self.node_name {
            return self.store.read(&op.filename);
        }

        let network = self
            .network()
            .ok_or_else(|| Error::Internal("no network bound".into()))?;
        let request = Request::GetFile {
            source_node: self.node_name.clone(),
            filename: op.filename.clone(),
        };

        let response = network.send(&op.source_node, &request)?;
        if !response.is_ok() {
            return Err(Error::Remote {
                peer: op.source_node.clone(),
                message: response.error_message(),
            });
        }

        let data = response
            .file_data
            .ok_or_else(|| Error::Protocol("get_file response without file_data".into()))?;
        Ok(BASE64.decode(data)?)
    }
}
