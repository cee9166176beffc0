//! Sync Module
//!
//! Anti-entropy reconciliation between nodes and the single apply path
//! shared by direct pushes and sync replay.

mod manager;

pub use manager::{ApplyOutcome, SyncManager, SyncReport, SyncState};
