//! Node
//!
//! Composition root: builds the file store, operation log, offline queue,
//! sync manager and network manager, binds them together and runs the
//! periodic drain + sync cycle.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::network::{MessageSender, NetworkConfig, NetworkManager, Request};
use crate::offline::{DrainReport, OfflineEntry, OfflineKind, OfflineQueue, SyncStatus};
use crate::oplog::{Operation, OperationLog};
use crate::shutdown::Shutdown;
use crate::store::{FileEntry, FileStore};
use crate::sync::{SyncManager, SyncReport, SyncState};

/// How a transfer request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOutcome {
    /// Pushed to the target and acknowledged
    Delivered,
    /// Held in the offline queue for later replay
    Queued,
}

/// Result of one periodic cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub drained: usize,
    pub requeued: usize,
    pub sync: Option<SyncReport>,
}

/// Snapshot of a node for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node: String,
    pub peers: BTreeMap<String, bool>,
    pub sync_state: SyncState,
    pub operations: usize,
    pub queued: usize,
}

/// One replication node
pub struct Node {
    config: WolfSyncConfig,
    store: Arc<FileStore>,
    oplog: Arc<OperationLog>,
    offline: Arc<OfflineQueue>,
    sync: Arc<SyncManager>,
    network: Arc<NetworkManager>,
    shutdown: Shutdown,
    cycle_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Build every component and bind the sync manager to the network
    pub fn new(config: WolfSyncConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(FileStore::new(&config.node.shared_dir)?);
        let oplog = Arc::new(OperationLog::open(config.oplog_path())?);
        let offline = Arc::new(OfflineQueue::open(&config.node.data_dir, Arc::clone(&store))?);
        let sync = Arc::new(SyncManager::new(
            config.node.name.clone(),
            Arc::clone(&store),
            Arc::clone(&oplog),
        ));

        let network = NetworkManager::new(
            NetworkConfig::from_config(&config),
            Arc::clone(&store),
            Arc::clone(&oplog),
            Arc::clone(&offline),
            Arc::clone(&sync),
        );
        let sender: Arc<dyn MessageSender> = network.clone();
        let sender: Weak<dyn MessageSender> = Arc::downgrade(&sender);
        sync.bind_network(sender)?;

        info!(
            "Node {} opened: {} logged operations, {} queued offline",
            config.node.name,
            oplog.len(),
            offline.len()
        );

        Ok(Arc::new(Self {
            config,
            store,
            oplog,
            offline,
            sync,
            network,
            shutdown: Shutdown::new(),
            cycle_thread: Mutex::new(None),
        }))
    }

    /// Start networking and the periodic cycle. Fails only if the listener
    /// cannot be bound.
    pub fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self.network.start()?;

        let mut cycle_thread = self.cycle_thread.lock().unwrap_or_else(|e| e.into_inner());
        if cycle_thread.is_some() {
            return Ok(addr);
        }

        let node = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.sync_interval();
        let handle = thread::Builder::new()
            .name("wolfsync-cycle".into())
            .spawn(move || {
                while !shutdown.wait_timeout(interval) {
                    match node.upgrade() {
                        Some(node) => {
                            node.run_cycle();
                        }
                        None => break,
                    }
                }
            })?;
        *cycle_thread = Some(handle);

        Ok(addr)
    }

    /// Stop background loops and the network server, waiting for them
    pub fn stop(&self) {
        info!("Stopping node {}", self.config.node.name);
        self.shutdown.trigger();
        self.network.stop();

        let handle = self.cycle_thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Cycle thread panicked");
            }
        }
    }

    /// One offline drain followed by one sync pass
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        // An entry older than a logged mutation of the same file would undo it
        let stale = |entry: &OfflineEntry| {
            self.oplog
                .latest_effective_for(&entry.filename, self.name())
                .map_or(false, |op| op.timestamp > entry.timestamp)
        };
        match self.offline.drain_unless(stale) {
            Ok(DrainReport { applied, requeued, .. }) => {
                report.drained = applied;
                report.requeued = requeued;
            }
            Err(e) => warn!("Offline drain failed: {}", e),
        }

        report.sync = self.sync.start_sync();
        report
    }

    pub fn name(&self) -> &str {
        &self.config.node.name
    }

    pub fn config(&self) -> &WolfSyncConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.network.local_addr()
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn oplog(&self) -> &Arc<OperationLog> {
        &self.oplog
    }

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        &self.offline
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn list_local(&self) -> Result<Vec<FileEntry>> {
        self.store.list()
    }

    /// List a peer's files. An unreachable peer yields an empty listing.
    pub fn list_remote(&self, peer: &str) -> Result<Vec<FileEntry>> {
        if peer == self.name() {
            return self.list_local();
        }
        if !self.network.knows(peer) {
            return Err(Error::UnknownPeer(peer.to_string()));
        }

        let request = Request::ListFiles {
            source_node: self.name().to_string(),
        };
        match self.network.send(peer, &request) {
            Ok(response) if response.is_ok() => Ok(response.files.unwrap_or_default()),
            Ok(response) => Err(Error::Remote {
                peer: peer.to_string(),
                message: response.error_message(),
            }),
            Err(e) if e.is_transport() => {
                debug!("Listing {} failed: {}", peer, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a local file to `target`.
    ///
    /// The transfer is logged first. If the target is known to be down, or
    /// the push fails, the content is queued offline instead.
    pub fn transfer(&self, filename: &str, target: &str) -> Result<TransferOutcome> {
        if target == self.name() {
            return Err(Error::InvalidRequest("cannot transfer a file to this node".into()));
        }
        if !self.network.knows(target) {
            return Err(Error::UnknownPeer(target.to_string()));
        }

        let bytes = self.store.read(filename)?;
        if bytes.len() > self.config.cluster.max_direct_transfer_bytes {
            return Err(Error::FileTooLarge {
                name: filename.to_string(),
                size: bytes.len(),
            });
        }
        let payload = BASE64.encode(&bytes);

        let operation = Operation::transfer(self.name(), target, filename, clock::now());
        self.oplog.append(&operation)?;

        if !self.network.is_alive(target) {
            self.offline.enqueue(OfflineKind::Save, filename, Some(payload))?;
            info!("{} is offline, queued {}", target, filename);
            return Ok(TransferOutcome::Queued);
        }

        match self.network.push_transfer(&operation, payload.clone()) {
            Ok(()) => Ok(TransferOutcome::Delivered),
            Err(e) => {
                warn!("Push of {} to {} failed, queueing: {}", filename, target, e);
                self.offline.enqueue(OfflineKind::Save, filename, Some(payload))?;
                Ok(TransferOutcome::Queued)
            }
        }
    }

    /// Delete a local file and notify every peer.
    ///
    /// Returns `false` if the file was not present.
    pub fn delete(&self, filename: &str) -> Result<bool> {
        if !self.store.delete(filename)? {
            return Ok(false);
        }

        let operation = Operation::delete(self.name(), filename, clock::now());
        self.oplog.append(&operation)?;
        self.offline.discard(OfflineKind::Save, filename)?;

        let peers = self.network.peer_names();
        if !peers.is_empty() && !peers.iter().any(|p| self.network.is_alive(p)) {
            self.offline.enqueue(OfflineKind::Delete, filename, None)?;
        }

        // Fire and forget; peers that miss it pull the operation during sync
        let _ = self.network.broadcast(Request::DeleteFile {
            source_node: self.name().to_string(),
            filename: operation.filename,
            timestamp: operation.timestamp,
        });

        info!("Deleted {}", filename);
        Ok(true)
    }

    /// Liveness of every node, this one included
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.network.status()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            node: self.name().to_string(),
            peers: self.status(),
            sync_state: self.sync.state(),
            operations: self.oplog.len(),
            queued: self.offline.len(),
        }
    }

    pub fn sync_status(&self, filename: &str) -> SyncStatus {
        self.offline.status(filename)
    }

    pub fn all_sync_status(&self) -> BTreeMap<String, SyncStatus> {
        self.offline.all_status()
    }
}
