//! Error types for pointmesh-transport.

use std::time::Duration;

use pointmesh_protocol::PeerId;
use thiserror::Error;

/// Failure to open the local endpoint or reach the bootstrap peer.
///
/// Surfaced to the caller: session creation or join fails outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The endpoint never signalled ready.
    #[error("endpoint not ready after {0:?}")]
    Timeout(Duration),

    /// Another endpoint is already registered under this id.
    #[error("peer id {0} is already in use")]
    IdTaken(PeerId),

    /// The bootstrap peer could not be reached.
    #[error("bootstrap peer {0} is unreachable")]
    BootstrapUnreachable(PeerId),

    /// The transport was closed while connecting.
    #[error("transport closed")]
    Closed,
}

/// Failure of a single outbound link. Logged and skipped by callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerLinkError {
    /// Nothing is listening under the remote id.
    #[error("peer {0} is not available")]
    Unavailable(PeerId),

    /// The remote refused or the path is blocked.
    #[error("link to {0} refused")]
    Refused(PeerId),

    /// Attempted to connect to our own id.
    #[error("refusing to connect to self")]
    SelfConnection,

    /// `connect` was called before `listen` succeeded.
    #[error("local endpoint is not listening")]
    NotListening,
}
