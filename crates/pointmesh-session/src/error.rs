//! Error types for pointmesh-session.

use pointmesh_protocol::ProtocolError;
use pointmesh_transport::ConnectError;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors returned to the caller of a session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Listening or reaching the bootstrap peer failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Snapshot storage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed identifiers.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// `resume` found nothing to resume.
    #[error("no cached session to resume")]
    NoCachedSession,

    /// The session task has stopped.
    #[error("session closed")]
    Closed,
}

/// Snapshot persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Runtime conditions reported as events rather than returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    /// A liveness probe failed; the session is offline until one succeeds.
    #[error("network unavailable: {reason}")]
    TransientNetwork { reason: String },

    /// Background reconnection to the bootstrap peer gave up.
    #[error("reconnection gave up after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },
}
