//! Offline Module
//!
//! Lets a node keep accepting mutations while cut off from the cluster and
//! replays them once connectivity returns.

mod queue;

pub use queue::{
    DrainReport, OfflineEntry, OfflineKind, OfflineQueue, SyncStatus, QUEUE_FILE_NAME,
    STATUS_FILE_NAME,
};
