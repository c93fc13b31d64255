//! Error type shared by every relay component.

use thiserror::Error;

/// Errors raised while decoding frames, merging state or talking to peers.
///
/// Per-frame and per-recipient errors are logged by their callers and never
/// tear down the connection that produced them.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A lib0 payload ended early or carried an invalid varint/string.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] yrs::encoding::read::Error),

    /// Sync sub-message tag outside SyncStep1/SyncStep2/Update.
    #[error("Unknown sync message type {0}")]
    UnknownSyncMessage(u64),

    /// The replica engine rejected an update or state summary.
    #[error("Replica error: {0}")]
    Replica(String),

    /// The transport is no longer open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The recipient's outbound queue is full; the frame was dropped.
    #[error("Outbound queue full")]
    Backpressure,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
