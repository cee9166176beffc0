//! Operation Types
//!
//! Defines the mutations that are logged locally and replicated across
//! nodes: file transfers and deletes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::clock::{self, Timestamp};

/// Kind of a replicated mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// File content delivered from `source_node` to `target_node`
    Transfer,
    /// File removed everywhere
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transfer => "transfer",
            OperationKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logged mutation
///
/// Immutable once logged. The identifier is derived from kind, filename
/// and timestamp only, so two nodes that observe the same event agree on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub source_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    pub filename: String,
    pub timestamp: Timestamp,
    /// Base64 file content, only carried on direct pushes and never logged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

impl Operation {
    /// Build a transfer operation
    pub fn transfer(
        source_node: impl Into<String>,
        target_node: impl Into<String>,
        filename: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        let filename = filename.into();
        Self {
            operation_id: operation_id(OperationKind::Transfer, &filename, timestamp),
            kind: OperationKind::Transfer,
            source_node: source_node.into(),
            target_node: Some(target_node.into()),
            filename,
            timestamp,
            file_data: None,
        }
    }

    /// Build a delete operation
    pub fn delete(
        source_node: impl Into<String>,
        filename: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        let filename = filename.into();
        Self {
            operation_id: operation_id(OperationKind::Delete, &filename, timestamp),
            kind: OperationKind::Delete,
            source_node: source_node.into(),
            target_node: None,
            filename,
            timestamp,
            file_data: None,
        }
    }

    /// Attach base64 content for a direct push
    pub fn with_payload(mut self, file_data: String) -> Self {
        self.file_data = Some(file_data);
        self
    }

    /// Copy of this operation without its payload
    pub fn without_payload(&self) -> Self {
        Self {
            file_data: None,
            ..self.clone()
        }
    }

    /// Whether this operation shaped the content `node` holds for the file.
    ///
    /// Deletes apply everywhere. A transfer counts on its target, which
    /// wrote the bytes, and on its source, which held them.
    pub fn affects(&self, node: &str) -> bool {
        match self.kind {
            OperationKind::Delete => true,
            OperationKind::Transfer => {
                self.source_node == node || self.target_node.as_deref() == Some(node)
            }
        }
    }

    /// Conflict ordering between operations on the same file.
    ///
    /// Later timestamp wins; equal timestamps are broken by source node name.
    pub fn precedence(&self, other: &Operation) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then_with(|| self.source_node.cmp(&other.source_node))
    }
}

/// Derive the identifier of an operation
pub fn operation_id(kind: OperationKind, filename: &str, timestamp: Timestamp) -> String {
    format!("{}_{}_{}", kind, filename, clock::to_micros(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_is_deterministic() {
        let a = Operation::delete("node-a", "report.txt", 1700000000.123456);
        let b = Operation::delete("node-b", "report.txt", 1700000000.123456);
        assert_eq!(a.operation_id, b.operation_id);
        assert_eq!(a.operation_id, "delete_report.txt_1700000000123456");

        let c = Operation::transfer("node-a", "node-b", "report.txt", 1700000000.123456);
        assert_ne!(a.operation_id, c.operation_id);
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::transfer("a", "b", "x.txt", 10.5);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "transfer");
        assert_eq!(json["target_node"], "b");
        assert!(json.get("file_data").is_none());

        let del = Operation::delete("a", "x.txt", 11.0);
        let json = serde_json::to_value(&del).unwrap();
        assert!(json.get("target_node").is_none());
    }

    #[test]
    fn test_precedence_tie_break() {
        let older = Operation::delete("z-node", "f", 1.0);
        let newer = Operation::delete("a-node", "f", 2.0);
        assert_eq!(older.precedence(&newer), Ordering::Less);

        let left = Operation::delete("a-node", "f", 3.0);
        let right = Operation::delete("b-node", "f", 3.0);
        assert_eq!(left.precedence(&right), Ordering::Less);
        assert_eq!(right.precedence(&left), Ordering::Greater);
    }

    #[test]
    fn test_payload_is_stripped() {
        let op = Operation::transfer("a", "b", "x", 1.0).with_payload("aGk=".into());
        assert!(op.file_data.is_some());
        assert!(op.without_payload().file_data.is_none());
        assert_eq!(op.without_payload().operation_id, op.operation_id);
    }
}
