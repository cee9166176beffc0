//! Network Manager
//!
//! Owns the peer table, the inbound server and the heartbeat and liveness
//! loops. Inbound requests are dispatched to the file store, the operation
//! log and the sync manager.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::client::RpcClient;
use super::liveness::PeerTable;
use super::protocol::{Request, Response};
use super::server::{NetworkServer, RequestHandler};
use super::{MessageSender, NetworkConfig};
use crate::clock;
use crate::config::Peer;
use crate::error::{Error, Result};
use crate::offline::OfflineQueue;
use crate::oplog::{Operation, OperationLog};
use crate::shutdown::Shutdown;
use crate::store::FileStore;
use crate::sync::SyncManager;

/// Handle on a broadcast in progress.
///
/// Dropping it lets the sends finish in the background.
pub struct Broadcast {
    sends: Vec<(String, JoinHandle<bool>)>,
}

impl Broadcast {
    /// Peers the request was sent to
    pub fn peers(&self) -> Vec<&str> {
        self.sends.iter().map(|(peer, _)| peer.as_str()).collect()
    }

    /// Wait for every send and return the peers that answered with ok
    pub fn wait(self) -> Vec<String> {
        self.sends
            .into_iter()
            .filter_map(|(peer, handle)| match handle.join() {
                Ok(true) => Some(peer),
                _ => None,
            })
            .collect()
    }
}

/// Cluster networking for one node
pub struct NetworkManager {
    config: NetworkConfig,
    peers: HashMap<String, Peer>,
    liveness: PeerTable,
    client: RpcClient,
    server: NetworkServer,
    store: Arc<FileStore>,
    oplog: Arc<OperationLog>,
    offline: Arc<OfflineQueue>,
    sync: Arc<SyncManager>,
    shutdown: Shutdown,
    heartbeats_in_flight: Mutex<HashSet<String>>,
    /// Heartbeat and liveness loops, joined on stop
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl NetworkManager {
    pub fn new(
        config: NetworkConfig,
        store: Arc<FileStore>,
        oplog: Arc<OperationLog>,
        offline: Arc<OfflineQueue>,
        sync: Arc<SyncManager>,
    ) -> Arc<Self> {
        let peers = config
            .peers
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let liveness = PeerTable::new(
            config.node_name.clone(),
            config.peers.iter().map(|p| p.name.clone()),
        );
        let client = RpcClient::new(
            config.rpc_timeout,
            config.max_retries,
            config.retry_backoff,
            config.max_frame_bytes,
        );
        let server = NetworkServer::new(
            config.bind_address.clone(),
            config.max_frame_bytes,
            config.rpc_timeout,
        );

        Arc::new(Self {
            config,
            peers,
            liveness,
            client,
            server,
            store,
            oplog,
            offline,
            sync,
            shutdown: Shutdown::new(),
            heartbeats_in_flight: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the listener and start the heartbeat and liveness loops.
    ///
    /// Calling it again returns the address already bound.
    pub fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return self
                .server
                .local_addr()
                .ok_or_else(|| Error::Internal("network manager is stopping".into()));
        }

        let weak = Arc::downgrade(self);
        let handler: RequestHandler = Arc::new(move |request| match weak.upgrade() {
            Some(manager) => manager.handle_request(request),
            None => Response::error(Error::ShuttingDown.to_string()),
        });
        let addr = match self.server.start(handler) {
            Ok(addr) => addr,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let manager = Arc::clone(self);
        let heartbeat = thread::Builder::new()
            .name("wolfsync-heartbeat".into())
            .spawn(move || loop {
                manager.send_heartbeats();
                if manager.shutdown.wait_timeout(manager.config.heartbeat_interval) {
                    break;
                }
            })?;
        self.workers().push(heartbeat);

        let manager = Arc::clone(self);
        let liveness = thread::Builder::new()
            .name("wolfsync-liveness".into())
            .spawn(move || {
                while !manager.shutdown.wait_timeout(manager.config.heartbeat_interval) {
                    manager.liveness.expire(manager.config.node_timeout);
                }
            })?;
        self.workers().push(liveness);

        tracing::info!(
            "Node {} online with {} peer(s)",
            self.config.node_name,
            self.peers.len().saturating_sub(1)
        );
        Ok(addr)
    }

    /// Stop the server and wait for the heartbeat and liveness loops
    pub fn stop(&self) {
        self.shutdown.trigger();
        self.server.stop();

        let workers = std::mem::take(&mut *self.workers());
        for handle in workers {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("Background thread panicked");
            }
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Check whether `peer` is in the peer table (this node included)
    pub fn knows(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Names of every other node in the table
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .keys()
            .filter(|name| **name != self.config.node_name)
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_alive(&self, peer: &str) -> bool {
        self.liveness.is_alive(peer)
    }

    /// Liveness of every node, this one included
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.liveness.snapshot()
    }

    /// Send a request to `peer` and wait for the response.
    ///
    /// Success marks the peer alive. An exhausted retry budget marks it
    /// unreachable.
    pub fn send(&self, peer: &str, request: &Request) -> Result<Response> {
        if peer == self.config.node_name {
            return Err(Error::Protocol(format!("refusing to send {} to self", request.type_name())));
        }
        let target = self
            .peers
            .get(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;

        match self.client.send(&target.socket_address(), request) {
            Ok(response) => {
                self.liveness.record_contact(peer);
                Ok(response)
            }
            Err(Error::PeerUnreachable { attempts, .. }) => {
                self.liveness.mark_unreachable(peer);
                Err(Error::PeerUnreachable {
                    peer: peer.to_string(),
                    attempts,
                })
            }
            Err(e) => {
                // The peer answered, just not sensibly
                self.liveness.record_contact(peer);
                Err(e)
            }
        }
    }

    /// Send `request` to every other node concurrently
    pub fn broadcast(self: &Arc<Self>, request: Request) -> Broadcast {
        let request = Arc::new(request);
        let mut sends = Vec::new();

        for peer in self.peer_names() {
            let manager = Arc::clone(self);
            let request = Arc::clone(&request);
            let name = peer.clone();
            let spawned = thread::Builder::new()
                .name(format!("wolfsync-send-{}", peer))
                .spawn(move || match manager.send(&name, &request) {
                    Ok(response) if response.is_ok() => true,
                    Ok(response) => {
                        tracing::warn!(
                            "{} rejected {}: {}",
                            name,
                            request.type_name(),
                            response.error_message()
                        );
                        false
                    }
                    Err(e) => {
                        tracing::debug!("Broadcast of {} to {} failed: {}", request.type_name(), name, e);
                        false
                    }
                });
            match spawned {
                Ok(handle) => sends.push((peer, handle)),
                Err(e) => tracing::error!("Failed to spawn send thread: {}", e),
            }
        }

        Broadcast { sends }
    }

    /// Push file content for a logged transfer to its target
    pub fn push_transfer(&self, operation: &Operation, file_data: String) -> Result<()> {
        let target = operation
            .target_node
            .clone()
            .ok_or_else(|| Error::Protocol("transfer has no target".into()))?;

        let request = Request::TransferFile {
            source_node: self.config.node_name.clone(),
            target_node: Some(target.clone()),
            filename: operation.filename.clone(),
            file_data,
            timestamp: operation.timestamp,
        };

        let response = self.send(&target, &request)?;
        if !response.is_ok() {
            return Err(Error::Remote {
                peer: target,
                message: response.error_message(),
            });
        }

        self.offline.mark_synced(&operation.filename)?;
        tracing::info!("Transferred {} to {}", operation.filename, target);
        Ok(())
    }

    /// One heartbeat round. Peers with a heartbeat still outstanding are skipped.
    fn send_heartbeats(self: &Arc<Self>) {
        for peer in self.peer_names() {
            {
                let mut in_flight = self.heartbeats_in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !in_flight.insert(peer.clone()) {
                    continue;
                }
            }

            let manager = Arc::clone(self);
            let name = peer.clone();
            let spawned = thread::Builder::new()
                .name(format!("wolfsync-heartbeat-{}", peer))
                .spawn(move || {
                    let request = Request::Heartbeat {
                        source_node: manager.config.node_name.clone(),
                        timestamp: clock::now(),
                    };
                    if let Err(e) = manager.send(&name, &request) {
                        tracing::trace!("Heartbeat to {} failed: {}", name, e);
                    }
                    manager
                        .heartbeats_in_flight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&name);
                });

            if let Err(e) = spawned {
                tracing::error!("Failed to spawn heartbeat thread: {}", e);
                self.heartbeats_in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&peer);
            }
        }
    }

    /// Dispatch one inbound request
    pub fn handle_request(&self, request: Request) -> Response {
        let source = request.source_node().to_string();
        if source != self.config.node_name {
            self.liveness.record_contact(&source);
        }

        match request {
            Request::Heartbeat { .. } => Response::ok(),

            Request::TransferFile {
                source_node,
                target_node,
                filename,
                file_data,
                timestamp,
            } => {
                let target = target_node.unwrap_or_else(|| self.config.node_name.clone());
                let operation =
                    Operation::transfer(source_node, target, filename, timestamp).with_payload(file_data);
                self.apply(operation)
            }

            Request::DeleteFile {
                source_node,
                filename,
                timestamp,
            } => self.apply(Operation::delete(source_node, filename, timestamp)),

            Request::SyncRequest { last_timestamp, .. } => {
                Response::ok().with_operations(self.oplog.since(last_timestamp))
            }

            Request::SyncOperation { operation, .. } => self.apply(operation),

            Request::ListFiles { .. } => match self.store.list() {
                Ok(files) => Response::ok().with_files(files),
                Err(e) => Response::error(e.to_string()),
            },

            Request::GetFile { filename, .. } => match self.store.read(&filename) {
                Ok(bytes) => Response::ok().with_file_data(BASE64.encode(bytes)),
                Err(Error::FileNotFound(_)) => Response::error("file not found"),
                Err(e) => Response::error(e.to_string()),
            },
        }
    }

    fn apply(&self, operation: Operation) -> Response {
        let id = operation.operation_id.clone();
        match self.sync.apply_operation(operation) {
            Ok(outcome) => {
                tracing::debug!("Applied pushed operation {}: {:?}", id, outcome);
                Response::ok()
            }
            Err(e) => {
                tracing::warn!("Failed to apply pushed operation {}: {}", id, e);
                Response::error(e.to_string())
            }
        }
    }
}

impl MessageSender for NetworkManager {
    fn node_name(&self) -> &str {
        &self.config.node_name
    }

    fn send(&self, peer: &str, request: &Request) -> Result<Response> {
        NetworkManager::send(self, peer, request)
    }

    fn peer_status(&self) -> BTreeMap<String, bool> {
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OperationKind;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: Arc<NetworkManager>,
        store: Arc<FileStore>,
        oplog: Arc<OperationLog>,
    }

    fn fixture(peers: &[(&str, u16)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("files")).unwrap());
        let oplog = Arc::new(OperationLog::open(dir.path().join("operations.log")).unwrap());
        let offline = Arc::new(OfflineQueue::open(dir.path(), Arc::clone(&store)).unwrap());
        let sync = Arc::new(SyncManager::new("node-1", Arc::clone(&store), Arc::clone(&oplog)));

        let config = NetworkConfig {
            node_name: "node-1".into(),
            bind_address: "127.0.0.1:0".into(),
            peers: peers
                .iter()
                .map(|(name, port)| Peer {
                    name: name.to_string(),
                    address: "127.0.0.1".into(),
                    port: *port,
                })
                .collect(),
            heartbeat_interval: Duration::from_millis(50),
            node_timeout: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(200),
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
            max_frame_bytes: 1024 * 1024,
        };
        let manager = NetworkManager::new(config, Arc::clone(&store), Arc::clone(&oplog), offline, sync);

        Fixture {
            _dir: dir,
            manager,
            store,
            oplog,
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_send_to_self_rejected() {
        let f = fixture(&[("node-1", 1), ("node-2", closed_port())]);
        let err = f
            .manager
            .send("node-1", &Request::ListFiles { source_node: "node-1".into() })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(f.manager.is_alive("node-1"));
    }

    #[test]
    fn test_unknown_peer() {
        let f = fixture(&[("node-1", 1)]);
        let err = f
            .manager
            .send("ghost", &Request::ListFiles { source_node: "node-1".into() })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[test]
    fn test_failed_send_marks_unreachable() {
        let f = fixture(&[("node-1", 1), ("node-2", closed_port())]);
        assert!(f.manager.is_alive("node-2"));

        let err = f
            .manager
            .send(
                "node-2",
                &Request::Heartbeat {
                    source_node: "node-1".into(),
                    timestamp: 1.0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { attempts: 2, .. }));
        assert!(!f.manager.is_alive("node-2"));
        assert_eq!(f.manager.status().get("node-2"), Some(&false));
    }

    #[test]
    fn test_inbound_contact_revives_peer() {
        let f = fixture(&[("node-1", 1), ("node-2", closed_port())]);
        f.manager.liveness.mark_unreachable("node-2");

        let resp = f.manager.handle_request(Request::Heartbeat {
            source_node: "node-2".into(),
            timestamp: 2.0,
        });
        assert!(resp.is_ok());
        assert!(f.manager.is_alive("node-2"));
    }

    #[test]
    fn test_inbound_transfer_and_delete() {
        let f = fixture(&[("node-1", 1), ("node-2", closed_port())]);

        let resp = f.manager.handle_request(Request::TransferFile {
            source_node: "node-2".into(),
            target_node: Some("node-1".into()),
            filename: "report.txt".into(),
            file_data: BASE64.encode(b"hello"),
            timestamp: 10.0,
        });
        assert!(resp.is_ok());
        assert_eq!(f.store.read("report.txt").unwrap(), b"hello");
        assert_eq!(f.oplog.len(), 1);

        let resp = f.manager.handle_request(Request::DeleteFile {
            source_node: "node-2".into(),
            filename: "report.txt".into(),
            timestamp: 11.0,
        });
        assert!(resp.is_ok());
        assert!(!f.store.exists("report.txt"));

        let entries = f.oplog.entries();
        assert_eq!(entries[1].kind, OperationKind::Delete);
    }

    #[test]
    fn test_sync_request_returns_newer_operations() {
        let f = fixture(&[("node-1", 1)]);
        f.oplog.append(&Operation::delete("node-1", "a", 1.0)).unwrap();
        f.oplog.append(&Operation::delete("node-1", "b", 5.0)).unwrap();

        let resp = f.manager.handle_request(Request::SyncRequest {
            source_node: "node-2".into(),
            last_timestamp: 2.0,
        });
        let ops = resp.operations.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].filename, "b");
    }

    #[test]
    fn test_get_file_and_list_files() {
        let f = fixture(&[("node-1", 1)]);
        f.store.write("notes/a.txt", b"abc").unwrap();

        let resp = f.manager.handle_request(Request::GetFile {
            source_node: "node-2".into(),
            filename: "notes/a.txt".into(),
        });
        assert_eq!(BASE64.decode(resp.file_data.unwrap()).unwrap(), b"abc");

        let resp = f.manager.handle_request(Request::GetFile {
            source_node: "node-2".into(),
            filename: "missing".into(),
        });
        assert_eq!(resp.message.as_deref(), Some("file not found"));

        let resp = f.manager.handle_request(Request::ListFiles {
            source_node: "node-2".into(),
        });
        assert!(resp.files.unwrap().iter().any(|e| e.name == "notes/a.txt"));
    }

    #[test]
    fn test_bad_payload_is_error_response() {
        let f = fixture(&[("node-1", 1)]);
        let resp = f.manager.handle_request(Request::TransferFile {
            source_node: "node-2".into(),
            target_node: None,
            filename: "x".into(),
            file_data: "!!!not base64!!!".into(),
            timestamp: 1.0,
        });
        assert!(!resp.is_ok());
        assert!(f.oplog.is_empty());
    }

    #[test]
    fn test_broadcast_reports_acknowledging_peers() {
        let responder = NetworkServer::new("127.0.0.1:0", 1024, Duration::from_secs(1));
        let handler: RequestHandler = Arc::new(|_| Response::ok());
        let live_port = responder.start(handler).unwrap().port();

        let f = fixture(&[("node-1", 1), ("node-2", live_port), ("node-3", closed_port())]);
        let broadcast = f.manager.broadcast(Request::Heartbeat {
            source_node: "node-1".into(),
            timestamp: 3.0,
        });
        assert_eq!(broadcast.peers(), vec!["node-2", "node-3"]);

        let acked = broadcast.wait();
        assert_eq!(acked, vec!["node-2".to_string()]);
        assert!(f.manager.is_alive("node-2"));
        assert!(!f.manager.is_alive("node-3"));
        responder.stop();
    }

    #[test]
    fn test_start_is_idempotent_and_stop_releases_port() {
        let f = fixture(&[("node-1", 1)]);
        let first = f.manager.start().unwrap();
        let second = f.manager.start().unwrap();
        assert_eq!(first, second);

        f.manager.stop();
        assert!(std::net::TcpListener::bind(first).is_ok());
        // Heartbeat and liveness loops were joined
        assert_eq!(Arc::strong_count(&f.manager), 1);
    }
}
