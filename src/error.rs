//! Error types for debug-wire.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum DebugWireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing violation (bad length prefix, oversized packet).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Structured field could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Peer hello was rejected.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A service with this name is already registered locally.
    #[error("Service already registered: {0}")]
    DuplicateService(String),

    /// Target address could not be parsed or is unsupported.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using DebugWireError.
pub type Result<T> = std::result::Result<T, DebugWireError>;
