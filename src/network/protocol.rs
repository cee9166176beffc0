//! Node Protocol
//!
//! Defines the JSON messages exchanged between nodes. Every connection
//! carries exactly one request and one response.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::oplog::Operation;
use crate::store::FileEntry;

/// Message returned for a missing or unrecognised `type`
pub const UNKNOWN_TYPE: &str = "unknown type";

/// Every request `type` a node understands
pub const MESSAGE_TYPES: &[&str] = &[
    "heartbeat",
    "transfer_file",
    "delete_file",
    "sync_request",
    "sync_operation",
    "list_files",
    "get_file",
];

/// Requests sent from one node to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check
    Heartbeat {
        source_node: String,
        timestamp: Timestamp,
    },

    /// Direct push of file content
    TransferFile {
        source_node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_node: Option<String>,
        filename: String,
        file_data: String,
        timestamp: Timestamp,
    },

    /// Direct delete notification
    DeleteFile {
        source_node: String,
        filename: String,
        timestamp: Timestamp,
    },

    /// Ask for every operation logged after `last_timestamp`
    SyncRequest {
        source_node: String,
        #[serde(default)]
        last_timestamp: Timestamp,
    },

    /// Apply one replicated operation
    SyncOperation {
        source_node: String,
        operation: Operation,
    },

    /// Ask for the remote directory listing
    ListFiles { source_node: String },

    /// Ask for a file's current content
    GetFile {
        source_node: String,
        filename: String,
    },
}

impl Request {
    /// Name of the sending node
    pub fn source_node(&self) -> &str {
        match self {
            Request::Heartbeat { source_node, .. }
            | Request::TransferFile { source_node, .. }
            | Request::DeleteFile { source_node, .. }
            | Request::SyncRequest { source_node, .. }
            | Request::SyncOperation { source_node, .. }
            | Request::ListFiles { source_node }
            | Request::GetFile { source_node, .. } => source_node,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Heartbeat { .. } => "heartbeat",
            Request::TransferFile { .. } => "transfer_file",
            Request::DeleteFile { .. } => "delete_file",
            Request::SyncRequest { .. } => "sync_request",
            Request::SyncOperation { .. } => "sync_operation",
            Request::ListFiles { .. } => "list_files",
            Request::GetFile { .. } => "get_file",
        }
    }
}

/// Outcome flag carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Response to any request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: None,
            operations: None,
            files: None,
            file_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn with_files(mut self, files: Vec<FileEntry>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_file_data(mut self, file_data: String) -> Self {
        self.file_data = Some(file_data);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Error text, or a placeholder when the peer sent none
    pub fn error_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| "unspecified error".to_string())
    }
}

/// Decode an inbound request body.
///
/// Failures are returned as the error response to send back.
pub fn decode_request(body: &[u8]) -> std::result::Result<Request, Response> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| Response::error("invalid json"))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if !MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(Response::error(UNKNOWN_TYPE));
    }

    serde_json::from_value(value).map_err(|e| Response::error(format!("malformed {}: {}", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let msg = Request::SyncRequest {
            source_node: "node-1".to_string(),
            last_timestamp: 12.5,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync_request");
        assert_eq!(json["source_node"], "node-1");
        assert_eq!(json["last_timestamp"], 12.5);
    }

    #[test]
    fn test_decode_known_type() {
        let body = br#"{"type":"heartbeat","source_node":"node-2","timestamp":1.0}"#;
        let req = decode_request(body).unwrap();
        assert_eq!(req.source_node(), "node-2");
        assert_eq!(req.type_name(), "heartbeat");
    }

    #[test]
    fn test_decode_unknown_type() {
        let resp = decode_request(br#"{"type":"reboot","source_node":"x"}"#).unwrap_err();
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            serde_json::json!({"status": "error", "message": "unknown type"})
        );

        let resp = decode_request(br#"{"source_node":"x"}"#).unwrap_err();
        assert_eq!(resp.message.as_deref(), Some(UNKNOWN_TYPE));
    }

    #[test]
    fn test_decode_bad_json_and_missing_fields() {
        let resp = decode_request(b"{oops").unwrap_err();
        assert_eq!(resp.message.as_deref(), Some("invalid json"));

        let resp = decode_request(br#"{"type":"get_file","source_node":"x"}"#).unwrap_err();
        assert!(resp.message.unwrap().starts_with("malformed get_file"));
    }

    #[test]
    fn test_sync_request_defaults_timestamp() {
        let req = decode_request(br#"{"type":"sync_request","source_node":"x"}"#).unwrap();
        assert_eq!(
            req,
            Request::SyncRequest {
                source_node: "x".into(),
                last_timestamp: 0.0
            }
        );
    }

    #[test]
    fn test_ok_response_shape() {
        let json = serde_json::to_value(Response::ok()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));

        let json = serde_json::to_value(Response::ok().with_operations(vec![])).unwrap();
        assert_eq!(json["operations"], serde_json::json!([]));
    }
}
