//! WolfSync - Peer-to-peer file replication
//!
//! Keeps a shared directory consistent across a fixed set of peer nodes.
//!
//! # Architecture
//!
//! Every node is equal. Local mutations are applied to the file store,
//! recorded in an append-only operation log and pushed to peers directly.
//! Mutations a peer missed are reconciled later by a pull-based
//! anti-entropy pass, and mutations made while cut off are held in a
//! durable offline queue.
//!
//! # Features
//!
//! - Length-prefixed JSON RPC over TCP, one exchange per connection
//! - Heartbeats with retry-then-mark-unreachable liveness tracking
//! - Idempotent operation replay with last-writer-wins per file
//! - Durable offline queue with per-file sync status
//! - HTTP API and command line control tool

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod offline;
pub mod oplog;
pub mod shutdown;
pub mod store;
pub mod sync;

pub use config::WolfSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::{NetworkManager, Request, Response};
    pub use crate::node::{Node, TransferOutcome};
    pub use crate::offline::{OfflineQueue, SyncStatus};
    pub use crate::oplog::{Operation, OperationKind, OperationLog};
    pub use crate::store::{FileEntry, FileStore};
    pub use crate::sync::{ApplyOutcome, SyncManager};
}
