//! WolfSync Error Types

use thiserror::Error;

/// Result type alias for WolfSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Peer {peer} unreachable after {attempts} attempts")]
    PeerUnreachable { peer: String, attempts: u32 },

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the configured limit")]
    FrameTooLarge(usize),

    #[error("Peer {peer} rejected request: {message}")]
    Remote { peer: String, message: String },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file payload: {0}")]
    Base64(#[from] base64::DecodeError),

    // Store errors
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File {name} is {size} bytes, above the direct transfer limit")]
    FileTooLarge { name: String, size: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable within an RPC retry budget
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::Network(_) => true,
            Error::Io(e) => !matches!(e.kind(), std::io::ErrorKind::InvalidInput),
            _ => false,
        }
    }

    /// Check if this error came from the transport rather than the peer
    pub fn is_transport(&self) -> bool {
        self.is_retryable() || matches!(self, Error::PeerUnreachable { .. })
    }
}
