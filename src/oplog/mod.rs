//! Operation Log Module
//!
//! Append-only, timestamp-ordered history of applied mutations, keyed by
//! a deterministic operation identifier.

pub mod entry;
mod log;

pub use entry::{operation_id, Operation, OperationKind};
pub use log::OperationLog;

/// File name of the operation log inside the data directory
pub const LOG_FILE_NAME: &str = "operations.log";
