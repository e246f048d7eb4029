//! Error types for chatrelay.

use thiserror::Error;

/// Common error type for chatrelay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The server is at capacity; the connection was discarded.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Malformed, oversized or duplicate handshake username.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A moderation command failed the role check.
    ///
    /// This is reported privately to the requester and never ends a connection.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Delivery to a single recipient failed.
    #[error("send failed: {0}")]
    Send(String),

    /// A frame could not be decoded.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An outgoing message does not fit in one frame. The connection stays open.
    #[error("message of {size} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge { size: usize, max: usize },

    /// The peer connection is not connected.
    #[error("not connected")]
    NotConnected,

    /// The local participant is muted and may not chat.
    #[error("muted")]
    Muted,

    /// The relay has shut down.
    #[error("relay is shut down")]
    Shutdown,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for chatrelay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
