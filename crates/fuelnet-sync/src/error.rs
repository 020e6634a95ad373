//! # Sync Error Types
//!
//! Error types for connections, handshakes and node configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  ConfigLoad     │  │  Disconnected   │  │  HandshakeFailed        │ │
//! │  │                 │  │  Timeout, Bind  │  │  UnexpectedMessage      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Domain       │  │    Storage      │  │     Internal            │ │
//! │  │  Rejected       │  │  StoreFailed    │  │  ShuttingDown           │ │
//! │  │  TankRefused    │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Line-level decode failures have their own type,
//! [`ProtocolError`](crate::protocol::ProtocolError), because they are
//! answered on the wire rather than propagated.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering connection, handshake and config failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid node configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish a TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer closed the connection or the socket failed mid-stream.
    #[error("Disconnected from peer")]
    Disconnected,

    /// Connection or handshake timeout.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// Could not bind the listening socket.
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A line that could not be decoded where a specific message was needed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The peer did not follow the IDENTIFY / ID handshake.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Unexpected message type.
    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// A request broke a business rule (busy dispenser, unknown grade, ...).
    #[error("Rejected: {0}")]
    Rejected(#[from] fuelnet_core::CoreError),

    /// The tank would not hand out the requested fuel.
    #[error("Tank refused: {0}")]
    TankRefused(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// A file or database operation failed.
    #[error("Storage error: {0}")]
    StoreFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Node is shutting down.
    #[error("Node is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fuelnet_store::StoreError> for SyncError {
    fn from(err: fuelnet_store::StoreError) -> Self {
        SyncError::StoreFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConnectionFailed(err.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for SyncError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        use tokio_util::codec::LinesCodecError;
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                SyncError::InvalidMessage("line exceeds maximum length".into())
            }
            LinesCodecError::Io(_) => SyncError::Disconnected,
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}
