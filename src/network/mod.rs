//! Network Module
//!
//! Handles TCP communication between nodes. Each exchange is a single
//! length-prefixed JSON request followed by a single response on a fresh
//! connection.

mod client;
mod liveness;
mod manager;
pub mod protocol;
mod server;

pub use client::RpcClient;
pub use liveness::PeerTable;
pub use manager::{Broadcast, NetworkManager};
pub use protocol::{decode_request, Request, Response, ResponseStatus};
pub use server::{NetworkServer, RequestHandler};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

use crate::config::{Peer, WolfSyncConfig};
use crate::error::{Error, Result};

/// Outbound messaging used by components that sit above the network layer
pub trait MessageSender: Send + Sync {
    /// This node's name
    fn node_name(&self) -> &str;

    /// Send one request to a named peer, retrying per the cluster policy
    fn send(&self, peer: &str, request: &Request) -> Result<Response>;

    /// Liveness of every node in the table, this node included
    fn peer_status(&self) -> BTreeMap<String, bool>;
}

/// Settings the network layer needs, taken from the node configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub node_name: String,
    pub bind_address: String,
    pub peers: Vec<Peer>,
    pub heartbeat_interval: Duration,
    pub node_timeout: Duration,
    pub rpc_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_frame_bytes: usize,
}

impl NetworkConfig {
    pub fn from_config(config: &WolfSyncConfig) -> Self {
        Self {
            node_name: config.node.name.clone(),
            bind_address: config.bind_address(),
            peers: config.peer_table(),
            heartbeat_interval: config.heartbeat_interval(),
            node_timeout: config.node_timeout(),
            rpc_timeout: config.rpc_timeout(),
            max_retries: config.cluster.max_retries,
            retry_backoff: config.retry_backoff(),
            max_frame_bytes: config.cluster.max_frame_bytes,
        }
    }
}

/// Read one length-prefixed frame body
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > max_len {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Write one length-prefixed frame body
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge(body.len()))?;
    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Serialize a message as JSON and write it as one frame
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body)
}

/// Read one frame and decode it as a response
pub fn read_response<R: Read>(reader: &mut R, max_len: usize) -> Result<Response> {
    let body = read_frame(reader, max_len)?;
    serde_json::from_slice(&body).map_err(|e| Error::Protocol(format!("bad response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{}").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 2, b'{', b'}']);

        let body = read_frame(&mut Cursor::new(buf), 16).unwrap();
        assert_eq!(body, b"{}");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[b'x'; 32]).unwrap();
        let err = read_frame(&mut Cursor::new(buf), 16).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(32)));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let buf = vec![0, 0, 0, 10, b'{'];
        let err = read_frame(&mut Cursor::new(buf), 64).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_response_roundtrip_through_frame() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Response::error("nope")).unwrap();
        let resp = read_response(&mut Cursor::new(buf), 1024).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.message.as_deref(), Some("nope"));
    }
}
