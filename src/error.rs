//! Error types for pipelink.

use thiserror::Error;

/// Main error type for all pipelink operations.
#[derive(Debug, Error)]
pub enum PipeLinkError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Base64 transport encoding error.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Protocol error (oversized line, invalid UTF-8, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The server could not produce a response for one batch item.
    #[error("Server failed to process item")]
    ItemFailed,

    /// The peer pipe never became available.
    #[error("Timed out connecting to pipe {0}")]
    ConnectTimeout(String),

    /// The peer did not drain a written frame in time.
    #[error("Timed out waiting for pipe {0} to drain")]
    DrainTimeout(String),

    /// Operation requires `connect()`/`start()` first.
    #[error("Not connected")]
    NotConnected,

    /// `start()`/`connect()` called twice.
    #[error("Already started")]
    AlreadyStarted,

    /// Operation attempted after dispose/shutdown.
    #[error("Disposed")]
    Disposed,

    /// Remote server process could not be launched or stopped.
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),
}

impl PipeLinkError {
    /// Whether this error means the peer went away (as opposed to a local failure).
    pub fn is_disconnect(&self) -> bool {
        match self {
            PipeLinkError::ConnectionClosed => true,
            PipeLinkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias using PipeLinkError.
pub type Result<T> = std::result::Result<T, PipeLinkError>;
